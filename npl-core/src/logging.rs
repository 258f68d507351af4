use crate::config::LogLevel;
use crate::protocol::Protocol;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub struct Logger {
    level: LogLevel,
    log_file: Option<PathBuf>,
}

impl Logger {
    pub fn new(level: LogLevel, log_file: Option<PathBuf>) -> Self {
        Self { level, log_file }
    }

    pub fn init(&self) -> Result<(), Box<dyn std::error::Error>> {
        let filter = EnvFilter::new(self.level.as_filter_str());

        let registry = Registry::default().with(filter);

        if let Some(log_file) = &self.log_file {
            let dir = log_file.parent().filter(|p| !p.as_os_str().is_empty());
            let file_appender = tracing_appender::rolling::daily(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                "npl-agent.log",
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leak the guard: this is a process-lifetime logger, not a scoped one,
            // so there is no later point at which dropping it would be meaningful.
            std::mem::forget(guard);

            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true);

            let _ = registry.with(file_layer).try_init();
        } else {
            let stdout_layer = fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true);

            let _ = registry.with(stdout_layer).try_init();
        }

        Ok(())
    }
}

pub fn log_port_reserved(node_port: u16, protocol: Protocol) {
    info!(node_port, %protocol, "reserved node port");
}

pub fn log_rule_installed(node_port: u16, pod_ip: IpAddr, pod_port: u16, protocol: Protocol) {
    info!(node_port, %pod_ip, pod_port, %protocol, "installed forwarding rule");
}

pub fn log_rule_removed(node_port: u16, pod_ip: IpAddr, pod_port: u16, protocol: Protocol) {
    info!(node_port, %pod_ip, pod_port, %protocol, "removed forwarding rule");
}

pub fn log_port_released(node_port: u16, protocol: Protocol) {
    info!(node_port, %protocol, "released node port reservation");
}

pub fn log_restore_skipped(node_port: u16, pod_ip: IpAddr, pod_port: u16, reason: &str) {
    warn!(node_port, %pod_ip, pod_port, reason, "skipping snapshot entry during restore");
}

pub fn log_retry_scheduled(context: &str, delay_secs: u64) {
    warn!(context, delay_secs, "scheduling background retry");
}
