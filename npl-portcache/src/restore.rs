use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use npl_core::log_retry_scheduled;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::driver::{PodNodePort, RuleDriver};

/// The fixed cadence the restore-sync task retries at when the bulk
/// `AddAllRules` call fails (§4.4).
pub const DEFAULT_RESTORE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Fires exactly once, after the restore-sync task's `AddAllRules` call
/// has succeeded. Dropping the receiver without waiting is fine: the sync
/// task keeps running and logging regardless of whether anyone is
/// listening for completion.
pub type RestoreComplete = oneshot::Receiver<()>;

/// Spawns the restore-sync task (§4.4 step 3): repeatedly asks `snapshot`
/// for the table's current InUse protocols per entry and pushes them to
/// the driver as a single bulk replace, so a partially-consistent host
/// filter converges. `snapshot` is re-invoked on every attempt rather than
/// captured once, since the table itself is the source of truth the
/// caller must not mutate until the returned receiver resolves (§4.4's
/// restore invariant) — re-reading costs nothing and stays correct if
/// that invariant is ever relaxed.
pub fn spawn_restore_sync<F, Fut>(driver: Arc<dyn RuleDriver>, snapshot: F, interval: Duration) -> RestoreComplete
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Vec<PodNodePort>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            let rules = snapshot().await;
            match driver.add_all_rules(&rules).await {
                Ok(()) => {
                    info!(rule_count = rules.len(), "restore-sync completed");
                    let _ = tx.send(());
                    return;
                }
                Err(err) => {
                    error!(%err, "restore-sync attempt failed, will retry");
                    log_retry_scheduled("restore-sync", interval.as_secs());
                    tokio::time::sleep(interval).await;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use async_trait::async_trait;
    use npl_core::Protocol;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct FlakyDriver {
        failures_remaining: AtomicUsize,
        applied: Mutex<Vec<PodNodePort>>,
    }

    #[async_trait]
    impl RuleDriver for FlakyDriver {
        async fn add_rule(
            &self,
            _node_port: u16,
            _pod_ip: IpAddr,
            _pod_port: u16,
            _protocol: Protocol,
        ) -> Result<(), DriverError> {
            unimplemented!("not exercised by restore-sync tests")
        }

        async fn delete_rule(
            &self,
            _node_port: u16,
            _pod_ip: IpAddr,
            _pod_port: u16,
            _protocol: Protocol,
        ) -> Result<(), DriverError> {
            unimplemented!("not exercised by restore-sync tests")
        }

        async fn add_all_rules(&self, rules: &[PodNodePort]) -> Result<(), DriverError> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(DriverError::new("backend not ready yet"));
            }
            *self.applied.lock().await = rules.to_vec();
            Ok(())
        }
    }

    fn rules() -> Vec<PodNodePort> {
        vec![PodNodePort {
            node_port: 61000,
            pod_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            pod_port: 8080,
            protocols: vec![Protocol::Tcp],
        }]
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately_when_driver_is_ready() {
        let driver: Arc<dyn RuleDriver> = Arc::new(FlakyDriver {
            failures_remaining: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        });
        let rx = spawn_restore_sync(driver.clone(), || async { rules() }, Duration::from_millis(1));
        rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_a_fixed_interval_until_the_driver_accepts() {
        let driver = Arc::new(FlakyDriver {
            failures_remaining: AtomicUsize::new(3),
            applied: Mutex::new(Vec::new()),
        });
        let applied_check = driver.clone();
        let dyn_driver: Arc<dyn RuleDriver> = driver;
        let rx = spawn_restore_sync(dyn_driver, || async { rules() }, Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(200)).await;
        rx.await.unwrap();
        assert_eq!(applied_check.applied.lock().await.len(), 1);
    }
}
