//! SQLite storage layer for Tally

mod identity;
mod migrations;
mod parse;
mod records;
mod traits;

use rusqlite::Connection;
use std::path::Path;
use tracing::instrument;

use crate::error::Result;
use crate::models::{SessionRecord, UserId};

pub use identity::IdentityStore;
pub use records::SessionRecordStore;
pub use traits::{IdentityProvider, SessionGateway};

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        migrations::get_current_version(&self.conn).unwrap_or(0)
    }

    pub fn identity(&self) -> IdentityStore<'_> {
        IdentityStore::new(&self.conn)
    }

    pub fn session_records(&self) -> SessionRecordStore<'_> {
        SessionRecordStore::new(&self.conn)
    }
}

impl IdentityProvider for Database {
    fn get_or_create_stable_user_id(&self) -> Result<UserId> {
        self.identity().get_or_create()
    }
}

impl SessionGateway for Database {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        self.session_records().save(record)
    }

    fn load(&self) -> Result<Option<SessionRecord>> {
        self.session_records().load()
    }

    fn clear(&self) -> Result<()> {
        self.session_records().clear()
    }
}
