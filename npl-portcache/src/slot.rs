use std::time::Duration;

use npl_core::{log_retry_scheduled, NplError, Protocol, Result};
use tracing::error;

use crate::opener::{PortOpener, PortReservation};

/// The fixed cadence `CloseOrRetryAsync` retries at when closing a
/// partially-reserved candidate's sockets fails (§4.2).
pub const DEFAULT_RELEASE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// State of the OS reservation and rule installation for one
/// (node port, protocol) pair, per §3's slot state machine:
///
/// ```text
///             reserve (open OS port)
///    *  ───────────────────────────▶ Open
///                                    │
///              install rule          │  delete rule
///     Open ───────────────────────▶ InUse ───────────────▶ Open
///      │
///      │ release OS port (close handle)
///      ▼
///    Closed (terminal)
/// ```
///
/// `Closed -> *` and `InUse -> Closed` are illegal: a slot must pass back
/// through `Open` (rule removed) before its OS reservation can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Open,
    InUse,
    Closed,
}

/// Per-protocol reservation/rule state attached to one node-port entry.
///
/// The release handle is `None` on platforms where the OS reservation is
/// dropped before rule installation (the Windows variant, §4.3′) or once
/// the handle has already been consumed.
pub struct ProtocolSlot {
    pub protocol: Protocol,
    pub state: SlotState,
    handle: Option<Box<dyn PortReservation>>,
}

impl std::fmt::Debug for ProtocolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSlot")
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl ProtocolSlot {
    /// A freshly reserved slot, backed by a real OS reservation.
    pub fn reserved(protocol: Protocol, handle: Box<dyn PortReservation>) -> Self {
        Self {
            protocol,
            state: SlotState::Open,
            handle: Some(handle),
        }
    }

    /// An Open placeholder slot with no OS-level handle to release, used by
    /// the Windows reservation strategy where the rule driver itself proves
    /// the port is free (§4.3′).
    pub fn placeholder(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: SlotState::Open,
            handle: None,
        }
    }

    pub fn mark_in_use(&mut self) {
        self.state = SlotState::InUse;
    }

    pub fn mark_open(&mut self) {
        self.state = SlotState::Open;
    }

    /// Consumes the release handle exactly once (invariant 5) and
    /// transitions `Open -> Closed`. A no-op if already `Closed`.
    /// Fails with `SlotInUseOnClose` if the slot is still `InUse`: the
    /// rule must be deleted first so the OS reservation is dropped only
    /// after the packet filter no longer references it.
    pub fn close(&mut self, node_port: u16) -> Result<()> {
        match self.state {
            SlotState::Closed => Ok(()),
            SlotState::InUse => Err(NplError::SlotInUseOnClose {
                node_port,
                protocol: self.protocol,
            }),
            SlotState::Open => {
                if let Some(handle) = self.handle.take() {
                    handle.release()?;
                }
                self.state = SlotState::Closed;
                Ok(())
            }
        }
    }
}

/// Reserves `port` for every supported protocol, in `Protocol::SUPPORTED`
/// order (§4.2's `ReserveAll`). On the first failure, the handles already
/// acquired for this candidate are hopeless to commit (the port as a
/// whole is unusable), so they're handed to [`close_or_retry_async`]
/// rather than leaked, and the original error is returned so the search
/// loop knows to try the next candidate.
pub(crate) async fn reserve_all(opener: &dyn PortOpener, port: u16) -> Result<Vec<ProtocolSlot>> {
    let mut acquired = Vec::with_capacity(Protocol::SUPPORTED.len());
    for protocol in Protocol::SUPPORTED {
        match opener.open(port, protocol).await {
            Ok(handle) => acquired.push(ProtocolSlot::reserved(protocol, handle)),
            Err(err) => {
                close_or_retry_async(port, acquired, DEFAULT_RELEASE_RETRY_INTERVAL);
                return Err(err);
            }
        }
    }
    Ok(acquired)
}

/// Releases every slot in `slots`, all of which are known to be `Open`
/// (freshly reserved, never committed). If any release fails, retries
/// the whole remaining batch on `interval` in a detached background
/// task indefinitely: leaking the OS reservation would be worse than an
/// unbounded retry loop, and nothing else references these slots (they
/// never made it into the table), so there is nothing to notify except
/// the log (§4.2 `CloseOrRetryAsync`).
pub(crate) fn close_or_retry_async(port: u16, mut slots: Vec<ProtocolSlot>, interval: Duration) {
    slots.retain(|slot| slot.state != SlotState::Closed);
    if slots.is_empty() {
        return;
    }
    tokio::spawn(async move {
        loop {
            let mut all_closed = true;
            for slot in &mut slots {
                if slot.state == SlotState::Closed {
                    continue;
                }
                if let Err(err) = slot.close(port) {
                    all_closed = false;
                    error!(port, protocol = %slot.protocol, %err, "failed to close abandoned reservation, will retry");
                }
            }
            if all_closed {
                return;
            }
            log_retry_scheduled(&format!("closing abandoned reservation on port {port}"), interval.as_secs());
            tokio::time::sleep(interval).await;
        }
    });
}
