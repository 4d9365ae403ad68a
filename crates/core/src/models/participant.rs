//! Participant and round models

use serde::{Deserialize, Serialize};

use super::{PeerId, UserId};

/// Presence classification derived from heartbeat replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Online,
    Away,
    Offline,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Away => "away",
            ConnectionStatus::Offline => "offline",
        }
    }
}

/// Phase of the current estimation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    #[default]
    Voting,
    Revealed,
}

/// Room settings changed by the facilitator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub auto_reveal: bool,
    /// Countdown length in seconds
    pub auto_reveal_duration: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reveal: false,
            auto_reveal_duration: 3,
        }
    }
}

/// A player in the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub transport_id: PeerId,
    pub user_id: UserId,
    pub name: String,
    /// Card value, `None` until the player votes
    pub vote: Option<String>,
    pub is_host: bool,
    #[serde(default)]
    pub connection_status: ConnectionStatus,
}

impl Participant {
    pub fn new(transport_id: PeerId, user_id: UserId, name: String) -> Self {
        Self {
            transport_id,
            user_id,
            name,
            vote: None,
            is_host: false,
            connection_status: ConnectionStatus::Online,
        }
    }

    pub fn has_voted(&self) -> bool {
        self.vote.is_some()
    }
}
