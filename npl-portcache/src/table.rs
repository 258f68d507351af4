use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use npl_core::{log_port_released, log_port_reserved, log_restore_skipped, log_rule_installed, log_rule_removed};
use npl_core::{NplError, PortRangeConfig, Protocol, Result};
use tokio::sync::RwLock;

use crate::driver::{PodNodePort, RuleDriver};
use crate::entry::{NodePortEntry, NodePortEntrySnapshot};
use crate::opener::PortOpener;
use crate::reservation::ReservationStrategy;
use crate::restore::{spawn_restore_sync, RestoreComplete, DEFAULT_RESTORE_RETRY_INTERVAL};
use crate::slot::{close_or_retry_async, SlotState, DEFAULT_RELEASE_RETRY_INTERVAL};

struct Inner {
    by_node_port: HashMap<u16, NodePortEntry>,
    by_endpoint: HashMap<(IpAddr, u16), u16>,
    start_port: u16,
    end_port: u16,
    search_cursor: u16,
}

/// The allocation table (§3, §4.1): maps node-port → entry and endpoint →
/// entry, owns the search cursor, and serializes every mutation through a
/// single reader-writer lock (§5). The rule driver, port opener, and
/// reservation strategy are immutable collaborators held outside the lock
/// — they don't participate in the invariants the lock protects, only the
/// two indices and the cursor do.
pub struct PortTable {
    inner: Arc<RwLock<Inner>>,
    driver: Arc<dyn RuleDriver>,
    opener: Arc<dyn PortOpener>,
    reservation: Arc<dyn ReservationStrategy>,
    release_retry_interval: Duration,
    restore_retry_interval: Duration,
}

impl PortTable {
    pub fn new(
        port_range: PortRangeConfig,
        driver: Arc<dyn RuleDriver>,
        opener: Arc<dyn PortOpener>,
        reservation: Arc<dyn ReservationStrategy>,
    ) -> Self {
        Self::with_intervals(
            port_range,
            driver,
            opener,
            reservation,
            DEFAULT_RELEASE_RETRY_INTERVAL,
            DEFAULT_RESTORE_RETRY_INTERVAL,
        )
    }

    /// Builds a table with non-default retry cadences, so tests don't have
    /// to wait on the real 5s/2s production intervals (§10.6).
    pub fn with_intervals(
        port_range: PortRangeConfig,
        driver: Arc<dyn RuleDriver>,
        opener: Arc<dyn PortOpener>,
        reservation: Arc<dyn ReservationStrategy>,
        release_retry_interval: Duration,
        restore_retry_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                by_node_port: HashMap::new(),
                by_endpoint: HashMap::new(),
                start_port: port_range.start_port,
                end_port: port_range.end_port,
                search_cursor: port_range.start_port,
            })),
            driver,
            opener,
            reservation,
            release_retry_interval,
            restore_retry_interval,
        }
    }

    /// The next port the search loop will probe first. Exposed for tests
    /// asserting invariant 5 (§8); not part of the table's operational API.
    pub async fn search_cursor(&self) -> u16 {
        self.inner.read().await.search_cursor
    }

    /// The boundary a caller that only has the protocol as text (a CNI
    /// handler, a CLI flag) goes through before reaching [`Self::add_rule`]
    /// (§4.1): anything [`Protocol::from_str`] doesn't recognize is
    /// rejected as `UnknownProtocol` before the table does anything else.
    pub async fn add_rule_for_protocol_name(&self, pod_ip: IpAddr, pod_port: u16, protocol: &str) -> Result<u16> {
        let protocol = protocol.parse::<Protocol>().map_err(NplError::UnknownProtocol)?;
        self.add_rule(pod_ip, pod_port, protocol).await
    }

    pub async fn add_rule(&self, pod_ip: IpAddr, pod_port: u16, protocol: Protocol) -> Result<u16> {
        let mut inner = self.inner.write().await;

        if let Some(&node_port) = inner.by_endpoint.get(&(pod_ip, pod_port)) {
            let entry = inner
                .by_node_port
                .get(&node_port)
                .expect("by_endpoint and by_node_port must agree");
            let state = entry
                .find_slot(protocol)
                .expect("every entry carries one slot per supported protocol")
                .state;
            match state {
                SlotState::InUse => {
                    return Err(NplError::AlreadyExists {
                        pod_ip,
                        pod_port,
                        protocol,
                    })
                }
                SlotState::Closed => {
                    return Err(NplError::InvalidState {
                        pod_ip,
                        pod_port,
                        protocol,
                    })
                }
                SlotState::Open => {}
            }

            self.driver
                .add_rule(node_port, pod_ip, pod_port, protocol)
                .await
                .map_err(|e| NplError::RuleInstallFailed {
                    node_port,
                    pod_ip,
                    pod_port,
                    protocol,
                    reason: e.to_string(),
                })?;

            inner
                .by_node_port
                .get_mut(&node_port)
                .unwrap()
                .find_slot_mut(protocol)
                .unwrap()
                .mark_in_use();
            log_rule_installed(node_port, pod_ip, pod_port, protocol);
            return Ok(node_port);
        }

        let (node_port, mut slots, rule_already_installed) =
            self.find_free_port(&mut inner, pod_ip, pod_port, protocol).await?;

        if !rule_already_installed {
            if let Err(err) = self.driver.add_rule(node_port, pod_ip, pod_port, protocol).await {
                close_or_retry_async(node_port, slots, self.release_retry_interval);
                return Err(NplError::RuleInstallFailed {
                    node_port,
                    pod_ip,
                    pod_port,
                    protocol,
                    reason: err.to_string(),
                });
            }
        }

        for slot in &mut slots {
            if slot.protocol == protocol {
                slot.mark_in_use();
            }
        }

        log_port_reserved(node_port, protocol);
        log_rule_installed(node_port, pod_ip, pod_port, protocol);

        inner
            .by_node_port
            .insert(node_port, NodePortEntry::new(node_port, pod_ip, pod_port, slots));
        inner.by_endpoint.insert((pod_ip, pod_port), node_port);

        Ok(node_port)
    }

    /// The cursor search loop shared by both reservation strategies (§4.3,
    /// §4.3′): only the per-candidate reservation step differs between
    /// platforms, so it's the only part delegated to `self.reservation`.
    async fn find_free_port(
        &self,
        inner: &mut Inner,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    ) -> Result<(u16, Vec<crate::slot::ProtocolSlot>, bool)> {
        let start = u32::from(inner.start_port);
        let end = u32::from(inner.end_port);
        let n = end - start + 1;

        for i in 0..n {
            let mut candidate = u32::from(inner.search_cursor) + i;
            if candidate > end {
                candidate -= n;
            }
            let port = candidate as u16;

            if inner.by_node_port.contains_key(&port) {
                continue;
            }

            match self
                .reservation
                .try_reserve(port, pod_ip, pod_port, protocol, self.opener.as_ref(), self.driver.as_ref())
                .await
            {
                Ok(reservation) => {
                    let mut next = u32::from(port) + 1;
                    if next > end {
                        next = start;
                    }
                    inner.search_cursor = next as u16;
                    return Ok((port, reservation.slots, reservation.rule_already_installed));
                }
                Err(_) => continue,
            }
        }

        Err(NplError::NoFreePort {
            start: inner.start_port,
            end: inner.end_port,
        })
    }

    pub async fn delete_rule(&self, pod_ip: IpAddr, pod_port: u16, protocol: Protocol) -> Result<()> {
        let mut inner = self.inner.write().await;

        let Some(&node_port) = inner.by_endpoint.get(&(pod_ip, pod_port)) else {
            return Ok(());
        };

        let in_use = inner
            .by_node_port
            .get(&node_port)
            .and_then(|e| e.find_slot(protocol))
            .is_some_and(|s| s.state == SlotState::InUse);

        if !in_use {
            return Ok(());
        }

        self.driver
            .delete_rule(node_port, pod_ip, pod_port, protocol)
            .await
            .map_err(|e| NplError::RuleDeleteFailed {
                node_port,
                pod_ip,
                pod_port,
                protocol,
                reason: e.to_string(),
            })?;

        let entry = inner.by_node_port.get_mut(&node_port).unwrap();
        entry.find_slot_mut(protocol).unwrap().mark_open();
        log_rule_removed(node_port, pod_ip, pod_port, protocol);

        if entry.in_use_count() == 0 {
            entry.close_open_slots()?;
            for protocol in Protocol::SUPPORTED {
                log_port_released(node_port, protocol);
            }
            inner.by_node_port.remove(&node_port);
            inner.by_endpoint.remove(&(pod_ip, pod_port));
        }

        Ok(())
    }

    /// Deletes every installed rule belonging to `pod_ip`. On the first
    /// driver failure the operation halts immediately and reports that
    /// error; whatever was already removed before the failure stays
    /// removed (partial progress is visible, per §4.1).
    pub async fn delete_rules_for_pod(&self, pod_ip: IpAddr) -> Result<()> {
        let mut inner = self.inner.write().await;

        let node_ports: Vec<u16> = inner
            .by_node_port
            .values()
            .filter(|e| e.pod_ip == pod_ip)
            .map(|e| e.node_port)
            .collect();

        for node_port in node_ports {
            let pod_port = inner.by_node_port.get(&node_port).unwrap().pod_port;

            for protocol in Protocol::SUPPORTED {
                let in_use = inner
                    .by_node_port
                    .get(&node_port)
                    .unwrap()
                    .protocol_in_use(protocol);
                if !in_use {
                    continue;
                }

                self.driver
                    .delete_rule(node_port, pod_ip, pod_port, protocol)
                    .await
                    .map_err(|e| NplError::RuleDeleteFailed {
                        node_port,
                        pod_ip,
                        pod_port,
                        protocol,
                        reason: e.to_string(),
                    })?;

                inner
                    .by_node_port
                    .get_mut(&node_port)
                    .unwrap()
                    .find_slot_mut(protocol)
                    .unwrap()
                    .mark_open();
                log_rule_removed(node_port, pod_ip, pod_port, protocol);
            }

            let entry = inner.by_node_port.get_mut(&node_port).unwrap();
            if entry.in_use_count() == 0 {
                entry.close_open_slots()?;
                inner.by_node_port.remove(&node_port);
                inner.by_endpoint.remove(&(pod_ip, pod_port));
            }
        }

        Ok(())
    }

    pub async fn rule_exists(&self, pod_ip: IpAddr, pod_port: u16, protocol: Protocol) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_endpoint
            .get(&(pod_ip, pod_port))
            .and_then(|node_port| inner.by_node_port.get(node_port))
            .is_some_and(|entry| entry.protocol_in_use(protocol))
    }

    pub async fn get_entry(&self, pod_ip: IpAddr, pod_port: u16) -> Option<NodePortEntrySnapshot> {
        let inner = self.inner.read().await;
        inner
            .by_endpoint
            .get(&(pod_ip, pod_port))
            .and_then(|node_port| inner.by_node_port.get(node_port))
            .map(|entry| entry.snapshot())
    }

    pub async fn get_data_for_pod_ip(&self, pod_ip: IpAddr) -> Vec<NodePortEntrySnapshot> {
        let inner = self.inner.read().await;
        inner
            .by_node_port
            .values()
            .filter(|entry| entry.pod_ip == pod_ip)
            .map(|entry| entry.snapshot())
            .collect()
    }

    /// Drops both indices without touching the driver or OS handles (§4.1):
    /// a shutdown-path operation that bypasses rule cleanup. The search
    /// cursor is deliberately left untouched (§9 open question).
    pub async fn cleanup_all_entries(&self) {
        let mut inner = self.inner.write().await;
        inner.by_node_port.clear();
        inner.by_endpoint.clear();
    }

    /// Rebuilds the table from a snapshot of previously-installed rules
    /// (§4.4). Each snapshot entry that fails to reserve is logged and
    /// dropped; once the lock is released, a background task repeatedly
    /// bulk-syncs the table's current state to the driver until it
    /// succeeds, resolving the returned receiver.
    ///
    /// Callers must not call `add_rule`/`delete_rule` until the receiver
    /// resolves; the table does not enforce this itself (§4.4).
    pub async fn restore_rules(&self, snapshot: Vec<PodNodePort>) -> RestoreComplete {
        {
            let mut inner = self.inner.write().await;
            for item in snapshot {
                if inner.by_node_port.contains_key(&item.node_port) {
                    continue;
                }

                match self.reservation.restore(item.node_port, self.opener.as_ref()).await {
                    Ok(mut slots) => {
                        for protocol in &item.protocols {
                            if let Some(slot) = slots.iter_mut().find(|s| s.protocol == *protocol) {
                                slot.mark_in_use();
                            }
                        }
                        inner.by_node_port.insert(
                            item.node_port,
                            NodePortEntry::new(item.node_port, item.pod_ip, item.pod_port, slots),
                        );
                        inner.by_endpoint.insert((item.pod_ip, item.pod_port), item.node_port);
                    }
                    Err(err) => {
                        log_restore_skipped(item.node_port, item.pod_ip, item.pod_port, &err.to_string());
                    }
                }
            }
        }

        let inner = self.inner.clone();
        spawn_restore_sync(
            self.driver.clone(),
            move || {
                let inner = inner.clone();
                async move {
                    // Re-acquires the exclusive lock per attempt (§5, §9):
                    // restore-sync is the one background task allowed to
                    // take the write half instead of the read half, since
                    // it must observe a state no concurrent add/delete is
                    // mutating mid-read.
                    let guard = inner.write().await;
                    guard
                        .by_node_port
                        .values()
                        .map(|entry| PodNodePort {
                            node_port: entry.node_port,
                            pod_ip: entry.pod_ip,
                            pod_port: entry.pod_port,
                            protocols: entry.in_use_protocols(),
                        })
                        .collect()
                }
            },
            self.restore_retry_interval,
        )
    }
}
