//! Tally Network Library
//!
//! Point-to-point transport for planning poker sessions.
//!
//! # Architecture
//!
//! - **Transport**: one identity per peer; a relay listens, members dial it
//! - **Room code**: `tally://host:port/<relay-id>`, shared out of band
//! - **Protocol**: `{type, payload}` envelopes in length-prefixed JSON frames
//!
//! # Usage
//!
//! ```ignore
//! // Relay listens
//! let (relay, events) = Transport::initialize(None, Endpoint::Listen(addr), options).await?;
//! let code = RoomCode::from_addr(relay.local_addr().await.unwrap(), relay.identity());
//!
//! // Member dials
//! let (member, events) = Transport::initialize(None, Endpoint::Dial, options).await?;
//! member.connect(&code).await?;
//! member.wait_until_open(code.relay).await?;
//! member.send(Envelope::Vote { value: Some("5".into()) }, Some(code.relay)).await?;
//! ```

pub mod error;
mod frame;
pub mod protocol;
pub mod room_code;
pub mod transport;

pub use error::{Error, FailureKind, Result};
pub use protocol::{Envelope, MessageTag};
pub use room_code::RoomCode;
pub use transport::{ConnectionState, Endpoint, Transport, TransportEvent, TransportOptions};

/// Default port for Tally relays
pub const DEFAULT_PORT: u16 = 7400;
