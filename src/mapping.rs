// Port mapping record shared by every driver

use crate::error::{NatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

const SUPPORTED_PROTOCOLS: [&str; 2] = ["TCP", "UDP"];

/// A single NAT static mapping: `protocol external_ip:external_port -> internal_ip:internal_port`
///
/// `external_id` is assigned by the driver when a mapping is read back from the
/// OS and never takes part in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub external_id: String,
    pub external_ip: IpAddr,
    pub external_port: u16,
    pub internal_ip: IpAddr,
    pub internal_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn new(
        protocol: impl Into<String>,
        external_ip: IpAddr,
        external_port: u16,
        internal_ip: IpAddr,
        internal_port: u16,
    ) -> Self {
        Self {
            external_id: String::new(),
            external_ip,
            external_port,
            internal_ip,
            internal_port,
            protocol: protocol.into(),
        }
    }

    /// Match on protocol and the external endpoint only (the delete key)
    pub fn same_external(&self, other: &PortMapping) -> bool {
        self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self.external_ip == other.external_ip
            && self.external_port == other.external_port
    }

    /// Check the fields every driver needs before issuing a command
    pub fn validate(&self) -> Result<()> {
        validate_protocol(&self.protocol)?;
        if self.external_port == 0 {
            return Err(NatError::invalid_field("ExternalPort", "port must be 1-65535"));
        }
        if self.internal_port == 0 {
            return Err(NatError::invalid_field("InternalPort", "port must be 1-65535"));
        }
        Ok(())
    }
}

impl Default for PortMapping {
    fn default() -> Self {
        Self::new(
            String::new(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        )
    }
}

impl PartialEq for PortMapping {
    fn eq(&self, other: &Self) -> bool {
        self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self.external_ip == other.external_ip
            && self.external_port == other.external_port
            && self.internal_ip == other.internal_ip
            && self.internal_port == other.internal_port
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol.to_uppercase(),
            endpoint(self.external_ip, self.external_port),
            endpoint(self.internal_ip, self.internal_port)
        )
    }
}

/// Only TCP and UDP mappings exist in either NAT surface
pub(crate) fn validate_protocol(protocol: &str) -> Result<()> {
    if SUPPORTED_PROTOCOLS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(protocol))
    {
        return Ok(());
    }
    Err(NatError::invalid_field(
        "Protocol",
        format!("{:?} is not TCP or UDP", protocol),
    ))
}

fn endpoint(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}
