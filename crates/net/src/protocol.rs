//! Network protocol message types
//!
//! Session messages travel as `{"type": TAG, "payload": {...}}` envelopes.
//! Transport packets wrap them together with the hello handshake that pairs
//! two identities. All packets are JSON-serialized and length-prefixed on
//! the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use tally_core::{PeerId, SessionState, Settings, UserId};

/// Session protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    /// First attach of a participant
    #[serde(rename_all = "camelCase")]
    Join { name: String, user_id: UserId },

    /// Attach after a reload or reconnect, located by stable identity
    #[serde(rename_all = "camelCase")]
    Rejoin { user_id: UserId, name: String },

    /// Full snapshot unicast to a participant that just attached
    Welcome(SessionState),

    /// Full snapshot broadcast after every authoritative change
    UpdateState(SessionState),

    Vote { value: Option<String> },

    Reveal {},

    Hide {},

    Reset {},

    /// Hand facilitation to the participant on this transport id
    #[serde(rename_all = "camelCase")]
    HostTransfer { new_host_identity: PeerId },

    /// Make the sender the facilitator
    HostClaim {},

    /// Liveness probe, timestamp in unix milliseconds
    Ping { timestamp: i64 },

    /// Liveness reply echoing the probe timestamp
    Pong { timestamp: i64 },

    #[serde(rename_all = "camelCase")]
    UpdateSettings {
        auto_reveal: bool,
        auto_reveal_duration: u32,
    },
}

/// Message type tag, the key of the dispatch handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Join,
    Rejoin,
    Welcome,
    UpdateState,
    Vote,
    Reveal,
    Hide,
    Reset,
    HostTransfer,
    HostClaim,
    Ping,
    Pong,
    UpdateSettings,
}

impl MessageTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::Join => "JOIN",
            MessageTag::Rejoin => "REJOIN",
            MessageTag::Welcome => "WELCOME",
            MessageTag::UpdateState => "UPDATE_STATE",
            MessageTag::Vote => "VOTE",
            MessageTag::Reveal => "REVEAL",
            MessageTag::Hide => "HIDE",
            MessageTag::Reset => "RESET",
            MessageTag::HostTransfer => "HOST_TRANSFER",
            MessageTag::HostClaim => "HOST_CLAIM",
            MessageTag::Ping => "PING",
            MessageTag::Pong => "PONG",
            MessageTag::UpdateSettings => "UPDATE_SETTINGS",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Envelope {
    pub fn tag(&self) -> MessageTag {
        match self {
            Envelope::Join { .. } => MessageTag::Join,
            Envelope::Rejoin { .. } => MessageTag::Rejoin,
            Envelope::Welcome(_) => MessageTag::Welcome,
            Envelope::UpdateState(_) => MessageTag::UpdateState,
            Envelope::Vote { .. } => MessageTag::Vote,
            Envelope::Reveal {} => MessageTag::Reveal,
            Envelope::Hide {} => MessageTag::Hide,
            Envelope::Reset {} => MessageTag::Reset,
            Envelope::HostTransfer { .. } => MessageTag::HostTransfer,
            Envelope::HostClaim {} => MessageTag::HostClaim,
            Envelope::Ping { .. } => MessageTag::Ping,
            Envelope::Pong { .. } => MessageTag::Pong,
            Envelope::UpdateSettings { .. } => MessageTag::UpdateSettings,
        }
    }

    pub fn update_settings(settings: Settings) -> Self {
        Envelope::UpdateSettings {
            auto_reveal: settings.auto_reveal,
            auto_reveal_duration: settings.auto_reveal_duration,
        }
    }
}

/// Transport-level packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    /// Dialer announces its transport identity
    Hello { peer_id: PeerId },
    /// Listener answers with its own identity
    HelloAck { peer_id: PeerId },
    /// Session message
    Data { envelope: Envelope },
}

impl Packet {
    /// Serialize packet to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize packet from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
