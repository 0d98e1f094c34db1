//! Session persistence: transcripts and usage records across restarts.
//!
//! A session is identified by an opaque 128-bit hex id and owns one
//! conversation plus its usage history. [`SessionBackend`] is the storage
//! seam; [`MemorySessionBackend`] serves development and tests, while
//! [`SqliteSessionBackend`] persists to two JSON-blob tables with UPSERT
//! semantics:
//!
//! ```sql
//! sessions(session_id PRIMARY KEY, conversation, created_at, updated_at)
//! usage(session_id PRIMARY KEY, usage_data, updated_at)
//! ```
//!
//! Operations are individually atomic with write-wins semantics on save;
//! the single-turn-per-session discipline upstream keeps concurrent saves
//! for one session from happening at all.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use serde::Serialize;

use crate::types::Message;
use crate::usage::UsageRecord;
use crate::{Error, Result};

/// Generates an opaque 128-bit session id, lowercase hex encoded.
pub fn generate_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// One row of the session listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
}

/// Storage seam for conversations and usage records.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Loads the conversation; empty when the session has no record.
    async fn load(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Saves the conversation, replacing any previous copy.
    async fn save(&self, session_id: &str, conversation: &[Message]) -> Result<()>;

    /// Drops the conversation.
    async fn reset(&self, session_id: &str) -> Result<()>;

    /// Loads usage records; empty when absent.
    async fn load_usage(&self, session_id: &str) -> Result<Vec<UsageRecord>>;

    /// Saves usage records, replacing any previous copy.
    async fn save_usage(&self, session_id: &str, records: &[UsageRecord]) -> Result<()>;

    /// Summaries of every stored session.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Deletes a session's conversation and usage records.
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, Vec<Message>>,
    usage: HashMap<String, Vec<UsageRecord>>,
}

/// In-memory backend for development and tests. Contents vanish with the
/// process.
#[derive(Default)]
pub struct MemorySessionBackend {
    state: Mutex<MemoryState>,
}

impl MemorySessionBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .lock()
            .conversations
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session_id: &str, conversation: &[Message]) -> Result<()> {
        self.lock()
            .conversations
            .insert(session_id.to_string(), conversation.to_vec());
        log::debug!(
            "session saved (memory): {session_id} ({} messages)",
            conversation.len()
        );
        Ok(())
    }

    async fn reset(&self, session_id: &str) -> Result<()> {
        self.lock().conversations.remove(session_id);
        Ok(())
    }

    async fn load_usage(&self, session_id: &str) -> Result<Vec<UsageRecord>> {
        Ok(self
            .lock()
            .usage
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_usage(&self, session_id: &str, records: &[UsageRecord]) -> Result<()> {
        self.lock()
            .usage
            .insert(session_id.to_string(), records.to_vec());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self
            .lock()
            .conversations
            .iter()
            .map(|(id, conversation)| SessionSummary {
                session_id: id.clone(),
                created_at: String::new(),
                updated_at: String::new(),
                message_count: conversation.len(),
            })
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.conversations.remove(session_id);
        state.usage.remove(session_id);
        Ok(())
    }
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

/// SQLite-backed session store.
///
/// Conversations and usage records are stored as UTF-8 JSON. The
/// connection sits behind a mutex; every operation is a single short
/// statement, so holding the lock across the blocking call is fine on a
/// tokio worker.
pub struct SqliteSessionBackend {
    conn: Mutex<Connection>,
}

impl SqliteSessionBackend {
    /// Opens (and initializes) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        log::info!("sqlite session backend opened: {path}");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                conversation TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS usage (
                session_id TEXT PRIMARY KEY,
                usage_data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionBackend for SqliteSessionBackend {
    async fn load(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT conversation FROM sessions WHERE session_id = ?1")?;
        let mut rows = stmt.query([session_id])?;

        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let conversation: Vec<Message> = serde_json::from_str(&raw)
                    .map_err(|e| Error::storage(format!("corrupt conversation JSON: {e}")))?;
                log::debug!(
                    "session loaded (sqlite): {session_id} ({} messages)",
                    conversation.len()
                );
                Ok(conversation)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, session_id: &str, conversation: &[Message]) -> Result<()> {
        let serialized = serde_json::to_string(conversation)?;
        self.lock().execute(
            "INSERT INTO sessions (session_id, conversation)
             VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET
                 conversation = excluded.conversation,
                 updated_at = datetime('now')",
            (session_id, &serialized),
        )?;
        log::debug!(
            "session saved (sqlite): {session_id} ({} messages)",
            conversation.len()
        );
        Ok(())
    }

    async fn reset(&self, session_id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        Ok(())
    }

    async fn load_usage(&self, session_id: &str) -> Result<Vec<UsageRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT usage_data FROM usage WHERE session_id = ?1")?;
        let mut rows = stmt.query([session_id])?;

        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::storage(format!("corrupt usage JSON: {e}")))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn save_usage(&self, session_id: &str, records: &[UsageRecord]) -> Result<()> {
        let serialized = serde_json::to_string(records)?;
        self.lock().execute(
            "INSERT INTO usage (session_id, usage_data)
             VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET
                 usage_data = excluded.usage_data,
                 updated_at = datetime('now')",
            (session_id, &serialized),
        )?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, conversation, created_at, updated_at FROM sessions",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, raw, created_at, updated_at) = row?;
            let conversation: Vec<Message> = serde_json::from_str(&raw)
                .map_err(|e| Error::storage(format!("corrupt conversation JSON: {e}")))?;
            sessions.push(SessionSummary {
                session_id,
                created_at,
                updated_at,
                message_count: conversation.len(),
            });
        }
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        conn.execute("DELETE FROM usage WHERE session_id = ?1", [session_id])?;
        log::debug!("session deleted (sqlite): {session_id}");
        Ok(())
    }
}
