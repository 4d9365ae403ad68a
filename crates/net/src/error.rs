//! Network error types
//!
//! Connection failures are classified so callers can tell an unreachable
//! room from a broken network or a stalled handshake.

use std::fmt;
use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Cause of a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The target identity is not reachable (refused, reset, wrong identity,
    /// or a listen address already taken)
    PeerUnavailable,
    /// The local network cannot route to the target
    NetworkUnreachable,
    /// No handshake completed within the bounded timeout
    HandshakeTimeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::PeerUnavailable => "peer unavailable",
            FailureKind::NetworkUnreachable => "network unreachable",
            FailureKind::HandshakeTimeout => "handshake timed out",
        };
        f.write_str(text)
    }
}

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed ({kind}): {detail}")]
    Connection { kind: FailureKind, detail: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport destroyed")]
    Destroyed,
}

impl Error {
    pub fn connection(kind: FailureKind, detail: impl Into<String>) -> Self {
        Error::Connection {
            kind,
            detail: detail.into(),
        }
    }

    /// Classification of a connection failure, if this is one
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Map an IO error from connect/bind/handshake to a classified failure
    pub fn classify(err: io::Error) -> Self {
        use io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotFound
            | ErrorKind::AddrInUse
            | ErrorKind::UnexpectedEof => FailureKind::PeerUnavailable,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::HandshakeTimeout,
            ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied => {
                FailureKind::NetworkUnreachable
            }
            _ => match err.raw_os_error() {
                // ENETUNREACH / EHOSTUNREACH on Linux and macOS
                Some(101) | Some(113) | Some(51) | Some(65) => FailureKind::NetworkUnreachable,
                _ => return Error::Io(err),
            },
        };
        Error::connection(kind, err.to_string())
    }
}
