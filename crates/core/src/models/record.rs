//! Persisted session record
//!
//! Written after every change that affects resumption, read back when the
//! process restarts so a participant can rejoin without rediscovering the room.

use serde::{Deserialize, Serialize};

use super::{PeerId, Settings, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Shareable room code of the relay
    pub room_code: String,
    pub is_host: bool,
    pub name: String,
    pub transport_id: PeerId,
    pub user_id: UserId,
    pub is_room_creator: bool,
    pub settings: Settings,
    pub countdown_start_time: Option<i64>,
    /// Stable identity of the facilitator when the record was written
    pub host_user_id: Option<UserId>,
}
