use std::net::IpAddr;
use thiserror::Error;

use crate::protocol::Protocol;

#[derive(Error, Debug)]
pub enum NplError {
    #[error("protocol {0:?} is not supported")]
    UnknownProtocol(String),

    #[error("rule for {pod_ip}:{pod_port}/{protocol} already exists")]
    AlreadyExists {
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    },

    #[error("invalid slot state for {pod_ip}:{pod_port}/{protocol}: slot is closed")]
    InvalidState {
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
    },

    #[error("no free node port available in [{start}, {end}]")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to install rule for node port {node_port} ({pod_ip}:{pod_port}/{protocol}): {reason}")]
    RuleInstallFailed {
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
        reason: String,
    },

    #[error("failed to delete rule for node port {node_port} ({pod_ip}:{pod_port}/{protocol}): {reason}")]
    RuleDeleteFailed {
        node_port: u16,
        pod_ip: IpAddr,
        pod_port: u16,
        protocol: Protocol,
        reason: String,
    },

    #[error("cannot release node port {node_port}: protocol {protocol} is still in use")]
    SlotInUseOnClose { node_port: u16, protocol: Protocol },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NplError>;
