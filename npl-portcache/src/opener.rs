use std::net::{Ipv4Addr, TcpListener, UdpSocket};

use async_trait::async_trait;
use npl_core::{Protocol, Result};

/// Acquires an OS-level reservation on `(port, protocol)`, proving the port
/// is not already bound elsewhere on the host. Named only by interface in
/// the NPL design (§6) — the production agent is expected to supply this;
/// [`StdPortOpener`] below is the crate's own reference implementation,
/// used by `PosixReservation` and by this crate's tests.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, port: u16, protocol: Protocol) -> Result<Box<dyn PortReservation>>;
}

/// The opaque release handle a [`PortOpener`] hands back. Its `release`
/// must be safe to call exactly once (invariant 5); a [`ProtocolSlot`]
/// enforces that by taking ownership of the handle out of an `Option`
/// before calling it.
///
/// [`ProtocolSlot`]: crate::slot::ProtocolSlot
pub trait PortReservation: Send + Sync {
    fn release(self: Box<Self>) -> std::io::Result<()>;
}

/// Reserves ports with real IPv4 TCP/UDP sockets bound to all interfaces,
/// matching the POSIX variant's policy in §4.3: the socket's only purpose
/// is to hold the port open against the rest of the host, so release is
/// simply dropping it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPortOpener;

impl StdPortOpener {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortOpener for StdPortOpener {
    async fn open(&self, port: u16, protocol: Protocol) -> Result<Box<dyn PortReservation>> {
        match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
                Ok(Box::new(TcpPortReservation(listener)))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
                Ok(Box::new(UdpPortReservation(socket)))
            }
        }
    }
}

struct TcpPortReservation(TcpListener);

impl PortReservation for TcpPortReservation {
    fn release(self: Box<Self>) -> std::io::Result<()> {
        // Dropping the listener closes the underlying file descriptor;
        // std exposes no separate fallible close for a bound TCP listener.
        drop(self);
        Ok(())
    }
}

struct UdpPortReservation(UdpSocket);

impl PortReservation for UdpPortReservation {
    fn release(self: Box<Self>) -> std::io::Result<()> {
        drop(self);
        Ok(())
    }
}
