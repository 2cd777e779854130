//! Session repository backed by SQLite

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;

use super::DbPool;
use crate::conversation::{ChatMessage, MessageRole, MessageStore, Session};
use crate::{Error, Result};

/// Session repository
#[derive(Clone)]
pub struct SessionRepo {
    pool: DbPool,
}

impl SessionRepo {
    /// Create a new session repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Look up a single session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?1",
            [session_id],
            session_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Count messages in a session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn message_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl MessageStore for SessionRepo {
    fn create_session(&self, title: &str) -> Result<Session> {
        let conn = self.conn()?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let stamp = timestamp(now);

        conn.execute(
            "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            [&id, title, &stamp],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(session = %id, "session created");
        Ok(Session {
            id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC, rowid DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let sessions = stmt
            .query_map([], session_from_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(sessions)
    }

    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let stamp = timestamp(Utc::now());
        let updated = tx
            .execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                [&stamp, session_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("session {session_id}")));
        }

        tx.execute(
            "INSERT INTO messages (id, session_id, role, content, created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?2))",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                session_id,
                role.as_str(),
                content,
                &stamp
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT role, content FROM messages
                 WHERE session_id = ?1 ORDER BY seq ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let messages = stmt
            .query_map([session_id], |row| {
                let role: String = row.get(0)?;
                Ok(ChatMessage {
                    role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
                    content: row.get(1)?,
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(messages)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
        updated_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

/// Fixed-width so stored timestamps sort lexically
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
