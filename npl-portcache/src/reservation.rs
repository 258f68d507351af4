use std::net::IpAddr;

use async_trait::async_trait;
use npl_core::{NplError, Protocol, Result};

use crate::driver::RuleDriver;
use crate::opener::PortOpener;
use crate::slot::{reserve_all, ProtocolSlot};

/// The outcome of reserving one candidate node port for one endpoint.
#[derive(Debug)]
pub struct Reservation {
    /// One slot per `Protocol::SUPPORTED`, in that order.
    pub slots: Vec<ProtocolSlot>,
    /// `true` when the strategy already installed the forwarding rule for
    /// `requested_protocol` as part of reservation (the Windows variant);
    /// the table must not call the driver a second time in that case.
    pub rule_already_installed: bool,
}

/// The platform-specific ordering of OS reservation and rule installation
/// (§4.3 POSIX, §4.3′ Windows), expressed as one small interface so the
/// table body itself never forks on platform (§9 design notes).
#[async_trait]
pub trait ReservationStrategy: Send + Sync {
    async fn try_reserve(
        &self,
        port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        requested_protocol: Protocol,
        opener: &dyn PortOpener,
        driver: &dyn RuleDriver,
    ) -> Result<Reservation>;

    /// The restore-path equivalent of `try_reserve` (§4.4): `port` already
    /// has a rule installed on the host (that's the entry being restored),
    /// so this only needs to re-establish this process's own bookkeeping
    /// for it, never touching the driver. Returns a full Open slot list;
    /// the caller marks the snapshot's listed protocols InUse afterwards.
    async fn restore(&self, port: u16, opener: &dyn PortOpener) -> Result<Vec<ProtocolSlot>>;
}

/// Reserves via OS sockets before touching the packet filter (§4.3): the
/// table still has to install the rule itself afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixReservation;

#[async_trait]
impl ReservationStrategy for PosixReservation {
    async fn try_reserve(
        &self,
        port: u16,
        _pod_ip: IpAddr,
        _pod_port: u16,
        _requested_protocol: Protocol,
        opener: &dyn PortOpener,
        _driver: &dyn RuleDriver,
    ) -> Result<Reservation> {
        let slots = reserve_all(opener, port).await?;
        Ok(Reservation {
            slots,
            rule_already_installed: false,
        })
    }

    async fn restore(&self, port: u16, opener: &dyn PortOpener) -> Result<Vec<ProtocolSlot>> {
        reserve_all(opener, port).await
    }
}

/// Installs the rule directly as the reservation step (§4.3′): the NAT
/// static mapping mechanism itself requires the port to be free, so a
/// failed rule install *is* the collision signal, and there is no OS
/// socket to release on either path.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsReservation;

#[async_trait]
impl ReservationStrategy for WindowsReservation {
    async fn try_reserve(
        &self,
        port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        requested_protocol: Protocol,
        _opener: &dyn PortOpener,
        driver: &dyn RuleDriver,
    ) -> Result<Reservation> {
        driver
            .add_rule(port, pod_ip, pod_port, requested_protocol)
            .await
            .map_err(|e| NplError::RuleInstallFailed {
                node_port: port,
                pod_ip,
                pod_port,
                protocol: requested_protocol,
                reason: e.to_string(),
            })?;

        let slots = Protocol::SUPPORTED
            .into_iter()
            .map(|protocol| {
                let mut slot = ProtocolSlot::placeholder(protocol);
                if protocol == requested_protocol {
                    slot.mark_in_use();
                }
                slot
            })
            .collect();

        Ok(Reservation {
            slots,
            rule_already_installed: true,
        })
    }

    async fn restore(&self, _port: u16, _opener: &dyn PortOpener) -> Result<Vec<ProtocolSlot>> {
        Ok(Protocol::SUPPORTED
            .into_iter()
            .map(ProtocolSlot::placeholder)
            .collect())
    }
}
