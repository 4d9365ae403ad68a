//! Stable user identity storage

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, instrument};

use crate::error::Result;
use crate::models::UserId;
use crate::storage::parse::parse_user_id;

/// Identity store
pub struct IdentityStore<'a> {
    conn: &'a Connection,
}

impl<'a> IdentityStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get the stored user id, if one was ever created
    pub fn get(&self) -> Result<Option<UserId>> {
        let result = self
            .conn
            .query_row("SELECT user_id FROM identity WHERE id = 1", [], |row| {
                let user_id_str: String = row.get(0)?;
                parse_user_id(&user_id_str)
            });

        match result {
            Ok(user_id) => Ok(Some(user_id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the stored user id, creating one on first use
    #[instrument(skip(self))]
    pub fn get_or_create(&self) -> Result<UserId> {
        if let Some(existing) = self.get()? {
            return Ok(existing);
        }

        let user_id = UserId::new();
        self.conn.execute(
            "INSERT INTO identity (id, user_id, created_at) VALUES (1, ?1, ?2)",
            params![user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        info!(user_id = %user_id, "Created stable user identity");
        Ok(user_id)
    }
}
