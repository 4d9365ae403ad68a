//! Collaborator traits consumed by the session manager
//!
//! The session manager only sees these interfaces, allowing different
//! implementations (SQLite, in-memory for tests).

use crate::error::Result;
use crate::models::{SessionRecord, UserId};

/// Supplies a user identity that survives restarts
pub trait IdentityProvider {
    fn get_or_create_stable_user_id(&self) -> Result<UserId>;
}

/// Saves and restores the record needed to resume a session
pub trait SessionGateway {
    fn save(&self, record: &SessionRecord) -> Result<()>;

    fn load(&self) -> Result<Option<SessionRecord>>;

    fn clear(&self) -> Result<()>;
}
