//! Host/port endpoints and the address grammars accepted on the command line.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Host used when an address string omits it.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid port number: {0}")]
    InvalidPort(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// A `host:port` pair, used both for bind addresses and tunnel destinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback endpoint for the given port.
    pub fn loopback(port: u16) -> Self {
        Self::new(DEFAULT_BIND_HOST, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(s: &str) -> Result<u16, AddressError> {
    s.parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(s.to_string()))
}

impl FromStr for Endpoint {
    type Err = AddressError;

    /// Parses `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::InvalidAddress(s.to_string()));
        }
        Ok(Endpoint::new(host, parse_port(port)?))
    }
}

/// Parse a listen address of the form `[host:]port`.
pub fn parse_listen_addr(s: &str) -> Result<Endpoint, AddressError> {
    match s.split_once(':') {
        Some((host, port)) if !host.is_empty() => Ok(Endpoint::new(host, parse_port(port)?)),
        Some((_, port)) => Ok(Endpoint::loopback(parse_port(port)?)),
        None => Ok(Endpoint::loopback(parse_port(s)?)),
    }
}

/// What the client should bind and where the server should send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSpec {
    /// Listen on a local TCP address. `remote` is `None` when the server
    /// is expected to be locked to a destination.
    Listen {
        local: Endpoint,
        remote: Option<Endpoint>,
    },
    /// Bridge standard input/output instead of a TCP listener.
    Stdio { remote: Endpoint },
}

impl FromStr for TunnelSpec {
    type Err = AddressError;

    /// Accepts `port`, `host:port`, `port:rhost:rport`,
    /// `host:port:rhost:rport` and `stdio:rhost:rport`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let toks: Vec<&str> = s.split(':').collect();
        match toks.as_slice() {
            [port] => Ok(TunnelSpec::Listen {
                local: Endpoint::loopback(parse_port(port)?),
                remote: None,
            }),
            [_, _] => Ok(TunnelSpec::Listen {
                local: parse_listen_addr(s)?,
                remote: None,
            }),
            ["stdio", host, port] => Ok(TunnelSpec::Stdio {
                remote: Endpoint::new(*host, parse_port(port)?),
            }),
            [local_port, host, port] => Ok(TunnelSpec::Listen {
                local: Endpoint::loopback(parse_port(local_port)?),
                remote: Some(Endpoint::new(*host, parse_port(port)?)),
            }),
            [local_host, local_port, host, port] => Ok(TunnelSpec::Listen {
                local: Endpoint::new(*local_host, parse_port(local_port)?),
                remote: Some(Endpoint::new(*host, parse_port(port)?)),
            }),
            _ => Err(AddressError::InvalidAddress(s.to_string())),
        }
    }
}

impl TunnelSpec {
    /// The destination requested from the server, if any.
    pub fn remote(&self) -> Option<&Endpoint> {
        match self {
            TunnelSpec::Listen { remote, .. } => remote.as_ref(),
            TunnelSpec::Stdio { remote } => Some(remote),
        }
    }
}
