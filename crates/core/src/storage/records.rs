//! Saved session record storage for resume after restart

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;

use crate::error::Result;
use crate::models::{SessionRecord, Settings};
use crate::storage::parse::{parse_peer_id, parse_user_id, parse_user_id_opt};

/// Session record store
pub struct SessionRecordStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionRecordStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Save the record (upserts the single row)
    #[instrument(skip(self, record), fields(room = %record.room_code, user_id = %record.user_id))]
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session_record
                (id, room_code, is_host, name, transport_id, user_id, is_room_creator,
                 auto_reveal, auto_reveal_duration, countdown_start_time, host_user_id, saved_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                room_code = excluded.room_code,
                is_host = excluded.is_host,
                name = excluded.name,
                transport_id = excluded.transport_id,
                user_id = excluded.user_id,
                is_room_creator = excluded.is_room_creator,
                auto_reveal = excluded.auto_reveal,
                auto_reveal_duration = excluded.auto_reveal_duration,
                countdown_start_time = excluded.countdown_start_time,
                host_user_id = excluded.host_user_id,
                saved_at = excluded.saved_at",
            params![
                record.room_code,
                record.is_host,
                record.name,
                record.transport_id.to_string(),
                record.user_id.to_string(),
                record.is_room_creator,
                record.settings.auto_reveal,
                record.settings.auto_reveal_duration,
                record.countdown_start_time,
                record.host_user_id.map(|id| id.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load the saved record
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<Option<SessionRecord>> {
        let result = self.conn.query_row(
            "SELECT room_code, is_host, name, transport_id, user_id, is_room_creator,
                    auto_reveal, auto_reveal_duration, countdown_start_time, host_user_id
             FROM session_record WHERE id = 1",
            [],
            |row| {
                let transport_id_str: String = row.get(3)?;
                let user_id_str: String = row.get(4)?;
                let host_user_id_str: Option<String> = row.get(9)?;

                Ok(SessionRecord {
                    room_code: row.get(0)?,
                    is_host: row.get(1)?,
                    name: row.get(2)?,
                    transport_id: parse_peer_id(&transport_id_str)?,
                    user_id: parse_user_id(&user_id_str)?,
                    is_room_creator: row.get(5)?,
                    settings: Settings {
                        auto_reveal: row.get(6)?,
                        auto_reveal_duration: row.get(7)?,
                    },
                    countdown_start_time: row.get(8)?,
                    host_user_id: parse_user_id_opt(host_user_id_str)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget the saved record (e.g. after leaving the room)
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM session_record WHERE id = 1", [])?;
        Ok(())
    }
}
