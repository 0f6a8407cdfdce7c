// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parse and format `host:port:protocol` server addresses. Splitting happens
//! right-to-left so IPv6 literals (which themselves contain colons) survive.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Plain,
    Tls,
}

impl Protocol {
    fn as_char(self) -> char {
        match self {
            Protocol::Plain => 't',
            Protocol::Tls => 's',
        }
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address must have the form host:port:protocol")]
    Malformed,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("invalid network protocol: {0}")]
    InvalidProtocol(String),
    #[error("port {0} is out of valid range")]
    PortOutOfRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.protocol.as_char())
    }
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Host may be an IPv6 literal, hence rsplit from the right.
        let mut parts = s.rsplitn(3, ':');
        let protocol_str = parts.next().ok_or(AddressError::Malformed)?;
        let port_str = parts.next().ok_or(AddressError::Malformed)?;
        let host = parts.next().ok_or(AddressError::Malformed)?;

        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        let protocol = match protocol_str {
            "t" => Protocol::Plain,
            "s" => Protocol::Tls,
            other => return Err(AddressError::InvalidProtocol(other.to_string())),
        };
        let port: u32 = port_str
            .parse()
            .map_err(|_| AddressError::PortOutOfRange(port_str.to_string()))?;
        if !(0 < port && port < 65536) {
            return Err(AddressError::PortOutOfRange(port_str.to_string()));
        }

        Ok(ServerAddress {
            host: host.to_string(),
            port: port as u16,
            protocol,
        })
    }
}
