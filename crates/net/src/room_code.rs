//! Shareable room codes
//!
//! Code format: tally://<host>[:<port>]/<relay-peer-id>
//!
//! The port defaults to [`DEFAULT_PORT`] when omitted.
//!
//! The relay's transport identity is the room's identity; the address tells
//! joiners where that identity can be reached.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tally_core::PeerId;

use crate::error::{Error, Result};
use crate::DEFAULT_PORT;

const SCHEME: &str = "tally://";

/// Parsed room code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomCode {
    pub host: IpAddr,
    pub port: u16,
    pub relay: PeerId,
}

impl RoomCode {
    pub fn new(host: IpAddr, port: u16, relay: PeerId) -> Self {
        Self { host, port, relay }
    }

    /// Create from a socket address
    pub fn from_addr(addr: SocketAddr, relay: PeerId) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            relay,
        }
    }

    /// Get the socket address for connection
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Format as URL string
    pub fn to_url(&self) -> String {
        format!("{}{}/{}", SCHEME, self.socket_addr(), self.relay)
    }

    /// Parse from URL string
    pub fn parse(s: &str) -> Result<Self> {
        let s = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::Protocol("Invalid room code: missing tally:// prefix".into()))?;

        let (host_port, relay) = s.split_once('/').ok_or_else(|| {
            Error::Protocol("Invalid room code: expected host:port/room-id".into())
        })?;

        let addr = match host_port.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => host_port
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
                .map_err(|_| {
                    Error::Protocol(format!("Invalid room code: bad address '{}'", host_port))
                })?,
        };

        let relay = PeerId::from_str(relay.trim_end_matches('/')).map_err(|_| {
            Error::Protocol(format!("Invalid room code: bad room id '{}'", relay))
        })?;

        Ok(Self::from_addr(addr, relay))
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

impl FromStr for RoomCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
