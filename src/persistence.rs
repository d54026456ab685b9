//! Conversation persistence.
//!
//! Writes are upserts keyed by id, so persisting the same message after every
//! step (or twice after a retry) is safe.

use crate::conversation::{Conversation, CourseContext, Message};
use crate::error::{QuillError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

/// Storage for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Save the conversation header and one message.
    async fn persist(
        &self,
        conversation: &Conversation,
        message: &Message,
        course: &CourseContext,
        user_identifier: &str,
    ) -> Result<()>;

    /// Load a conversation with its messages in insertion order.
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        course_name TEXT NOT NULL,
        user_identifier TEXT NOT NULL,
        header_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        role TEXT NOT NULL,
        message_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);
"#;

/// SQLite-backed store.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized conversation store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| QuillError::Persistence(format!("Failed to acquire lock: {}", e)))
    }
}

/// Conversation without messages, stored in the header row.
fn header_json(conversation: &Conversation) -> Result<String> {
    let mut header = conversation.clone();
    header.messages.clear();
    Ok(serde_json::to_string(&header)?)
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    #[instrument(skip_all, fields(conversation = %conversation.id, message = %message.id))]
    async fn persist(
        &self,
        conversation: &Conversation,
        message: &Message,
        course: &CourseContext,
        user_identifier: &str,
    ) -> Result<()> {
        let header = header_json(conversation)?;
        let message_json = serde_json::to_string(message)?;
        let seq = conversation
            .messages
            .iter()
            .position(|m| m.id == message.id)
            .unwrap_or(conversation.messages.len()) as i64;
        let role = serde_json::to_value(message.role)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let now = Utc::now().to_rfc3339();

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO conversations (id, name, course_name, user_identifier, header_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                course_name = excluded.course_name,
                user_identifier = excluded.user_identifier,
                header_json = excluded.header_json,
                updated_at = excluded.updated_at
            "#,
            params![
                conversation.id,
                conversation.name,
                course.course_name,
                user_identifier,
                header,
                now
            ],
        )?;
        conn.execute(
            r#"
            INSERT INTO messages (id, conversation_id, seq, role, message_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                seq = excluded.seq,
                message_json = excluded.message_json,
                updated_at = excluded.updated_at
            "#,
            params![message.id, conversation.id, seq, role, message_json, now],
        )?;

        debug!("Persisted message");
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock()?;

        let header: Option<String> = conn
            .query_row(
                "SELECT header_json FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(header) = header else {
            return Ok(None);
        };
        let mut conversation: Conversation = serde_json::from_str(&header)?;

        let mut stmt =
            conn.prepare("SELECT message_json FROM messages WHERE conversation_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![conversation_id], |row| row.get::<_, String>(0))?;
        for row in rows {
            conversation.messages.push(serde_json::from_str(&row?)?);
        }

        Ok(Some(conversation))
    }
}

/// Store that keeps conversations in process memory.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn persist(
        &self,
        conversation: &Conversation,
        message: &Message,
        _course: &CourseContext,
        _user_identifier: &str,
    ) -> Result<()> {
        let mut conversations = self
            .conversations
            .lock()
            .map_err(|e| QuillError::Persistence(format!("Failed to acquire lock: {}", e)))?;

        let entry = conversations.entry(conversation.id.clone()).or_insert_with(|| {
            let mut header = conversation.clone();
            header.messages.clear();
            header
        });
        entry.name = conversation.name.clone();
        entry.model = conversation.model.clone();
        entry.prompt = conversation.prompt.clone();
        entry.temperature = conversation.temperature;
        entry.upsert_message(message.clone());
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conversations = self
            .conversations
            .lock()
            .map_err(|e| QuillError::Persistence(format!("Failed to acquire lock: {}", e)))?;
        Ok(conversations.get(conversation_id).cloned())
    }
}
