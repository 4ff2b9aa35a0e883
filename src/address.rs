// Bind/forward address parsing
//
// Addresses look like "<scheme>://<host>:<port>" where scheme is udp or tcp.

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("udp"),
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self> {
        let (scheme, rest) = address.split_once("://").ok_or_else(|| Error::InvalidAddress {
            address: address.to_string(),
            reason: "missing scheme".to_string(),
        })?;

        let protocol = match scheme {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            other => return Err(Error::InvalidProtocol(other.to_string())),
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| Error::InvalidAddress {
            address: address.to_string(),
            reason: "missing port".to_string(),
        })?;
        let port = port.parse::<u16>().map_err(|_| Error::InvalidAddress {
            address: address.to_string(),
            reason: format!("invalid port {}", port),
        })?;

        // Bracketed IPv6 literals: "[::1]:514"
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidAddress {
                address: address.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
        })
    }

    /// "host:port" form accepted by tokio's lookup functions
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host_port())
    }
}
