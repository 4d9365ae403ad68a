//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use rusqlite::Error as SqlError;
use uuid::Uuid;

use crate::models::{PeerId, UserId};

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(|e| {
        SqlError::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn parse_user_id(s: &str) -> Result<UserId, SqlError> {
    parse_uuid(s).map(UserId)
}

pub fn parse_user_id_opt(s: Option<String>) -> Result<Option<UserId>, SqlError> {
    s.map(|s| parse_user_id(&s)).transpose()
}

pub fn parse_peer_id(s: &str) -> Result<PeerId, SqlError> {
    parse_uuid(s).map(PeerId)
}
