use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use npl_core::Protocol;
use thiserror::Error;
use tokio::sync::Mutex;

/// One previously-installed (or to-be-installed) forwarding rule, keyed
/// by node port. Used both as the bulk `AddAllRules` payload and as the
/// shape of a restore snapshot (§4.4, §6).
#[derive(Debug, Clone)]
pub struct PodNodePort {
    pub node_port: u16,
    pub pod_ip: IpAddr,
    pub pod_port: u16,
    pub protocols: Vec<Protocol>,
}

/// A driver-level failure: the packet-filter backend's own account of why
/// an operation did not succeed, independent of which table call it was
/// serving. The table wraps this into `NplError::RuleInstallFailed` /
/// `RuleDeleteFailed` with the endpoint context the driver itself doesn't
/// carry.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Abstraction over the host packet-filter subsystem (§6). Named only by
/// interface here — the real backend (Linux netfilter, a Windows NAT
/// static mapping) is an external collaborator. `add_rule` fails loudly
/// on a duplicate; `delete_rule` succeeds when the rule is already
/// absent; `add_all_rules` is a bulk, idempotent replace used by the
/// restore-sync path.
#[async_trait]
pub trait RuleDriver: Send + Sync {
    async fn add_rule(
        &self,
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    ) -> Result<(), DriverError>;

    async fn delete_rule(
        &self,
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    ) -> Result<(), DriverError>;

    async fn add_all_rules(&self, rules: &[PodNodePort]) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    node_port: u16,
    pod_ip: IpAddr,
    pod_port: u16,
    protocol: Protocol,
}

/// An in-memory `RuleDriver`, used by this crate's own test suite and as
/// a starting template for a real packet-filter-backed implementation
/// (§10.5). Installed rules live in a plain `HashSet`; there is
/// deliberately no persistence, matching the real backend's role as the
/// sole source of truth the restore path reads from.
#[derive(Default)]
pub struct InMemoryRuleDriver {
    rules: Mutex<HashSet<RuleKey>>,
}

impl InMemoryRuleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the driver with rules as if installed by a previous agent
    /// run, for exercising the restore path (scenario S6) without first
    /// driving them through `add_rule`.
    pub async fn seed(&self, rules: &[PodNodePort]) {
        let mut guard = self.rules.lock().await;
        for rule in rules {
            for protocol in &rule.protocols {
                guard.insert(RuleKey {
                    node_port: rule.node_port,
                    pod_ip: rule.pod_ip,
                    pod_port: rule.pod_port,
                    protocol: *protocol,
                });
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<PodNodePort> {
        let guard = self.rules.lock().await;
        let mut by_port: std::collections::HashMap<u16, PodNodePort> = std::collections::HashMap::new();
        for key in guard.iter() {
            let entry = by_port.entry(key.node_port).or_insert_with(|| PodNodePort {
                node_port: key.node_port,
                pod_ip: key.pod_ip,
                pod_port: key.pod_port,
                protocols: Vec::new(),
            });
            entry.protocols.push(key.protocol);
        }
        by_port.into_values().collect()
    }
}

#[async_trait]
impl RuleDriver for InMemoryRuleDriver {
    async fn add_rule(
        &self,
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    ) -> Result<(), DriverError> {
        let key = RuleKey {
            node_port,
            pod_ip,
            pod_port,
            protocol,
        };
        let mut guard = self.rules.lock().await;
        if !guard.insert(key) {
            return Err(DriverError::new(format!(
                "rule for node port {node_port} ({pod_ip}:{pod_port}/{protocol}) already installed"
            )));
        }
        Ok(())
    }

    async fn delete_rule(
        &self,
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    ) -> Result<(), DriverError> {
        let key = RuleKey {
            node_port,
            pod_ip,
            pod_port,
            protocol,
        };
        self.rules.lock().await.remove(&key);
        Ok(())
    }

    async fn add_all_rules(&self, rules: &[PodNodePort]) -> Result<(), DriverError> {
        let mut guard = self.rules.lock().await;
        guard.clear();
        for rule in rules {
            for protocol in &rule.protocols {
                guard.insert(RuleKey {
                    node_port: rule.node_port,
                    pod_ip: rule.pod_ip,
                    pod_port: rule.pod_port,
                    protocol: *protocol,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn duplicate_add_rule_fails_loudly() {
        let driver = InMemoryRuleDriver::new();
        driver.add_rule(61000, ip(), 8080, Protocol::Tcp).await.unwrap();
        assert!(driver.add_rule(61000, ip(), 8080, Protocol::Tcp).await.is_err());
    }

    #[tokio::test]
    async fn delete_absent_rule_succeeds() {
        let driver = InMemoryRuleDriver::new();
        assert!(driver.delete_rule(61000, ip(), 8080, Protocol::Tcp).await.is_ok());
    }

    #[tokio::test]
    async fn add_all_rules_replaces_contents() {
        let driver = InMemoryRuleDriver::new();
        driver.add_rule(61000, ip(), 8080, Protocol::Tcp).await.unwrap();
        driver
            .add_all_rules(&[PodNodePort {
                node_port: 61001,
                pod_ip: ip(),
                pod_port: 9000,
                protocols: vec![Protocol::Udp],
            }])
            .await
            .unwrap();
        assert!(driver.delete_rule(61000, ip(), 8080, Protocol::Tcp).await.is_ok());
        // The replaced rule is present: re-adding it as new should now fail as a duplicate.
        assert!(driver.add_rule(61001, ip(), 9000, Protocol::Udp).await.is_err());
    }
}
