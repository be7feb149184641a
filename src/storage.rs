use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{derive_title, Conversation, Message, ProviderId, Role, Screenshot};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT, -- set once from the first user text
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    project_id TEXT,
    created_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    updated_at INTEGER NOT NULL -- Unix Timestamp (millis)
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user' or 'assistant'
    text TEXT NOT NULL,
    screenshot TEXT, -- JSON blob: raw image, shape log, flattened image
    timestamp INTEGER NOT NULL, -- Unix Timestamp (millis)
    provider_used TEXT,
    model_used TEXT,
    status TEXT NOT NULL DEFAULT 'completed', -- how the turn ended
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
";

/// Persistence collaborator used by the turn loop.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        provider: ProviderId,
        model: &str,
        project_id: Option<Uuid>,
    ) -> Result<Conversation>;

    /// Appends `message` and returns the conversation as stored afterwards
    /// (title populated, `updated_at` bumped).
    async fn append_message(&self, conversation_id: Uuid, message: &Message) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;

    /// Conversations ordered by last update, newest first. Messages are not loaded.
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Deletes a conversation and its messages. Returns whether it existed.
    async fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }
        log::info!("Connecting to database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection so every query sees it.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        for statement in MIGRATIONS_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(pool)
                .await
                .context("Failed to run database migrations")?;
        }
        log::info!("Database migrations completed.");
        Ok(())
    }

    async fn load_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, text, screenshot, timestamp, provider_used, model_used, status
            FROM messages
            WHERE conversation_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        rows.iter().map(message_from_row).collect()
    }
}

fn from_millis(ms: i64, field: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Invalid {} timestamp", field))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let id: String = row.try_get("id")?;
    let provider: String = row.try_get("provider")?;
    let project_id: Option<String> = row.try_get("project_id")?;
    Ok(Conversation {
        id: Uuid::parse_str(&id).context("Failed to parse conversation ID")?,
        title: row.try_get("title")?,
        messages: Vec::new(),
        provider: provider.parse()?,
        model: row.try_get("model")?,
        project_id: project_id
            .map(|p| Uuid::parse_str(&p))
            .transpose()
            .context("Failed to parse project ID")?,
        created_at: from_millis(row.try_get("created_at")?, "created_at")?,
        updated_at: from_millis(row.try_get("updated_at")?, "updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let role: String = row.try_get("role")?;
    let screenshot: Option<String> = row.try_get("screenshot")?;
    let provider_used: Option<String> = row.try_get("provider_used")?;
    let status: String = row.try_get("status")?;
    Ok(Message {
        id: Uuid::parse_str(&id).context("Failed to parse message ID")?,
        role: role.parse()?,
        text: row.try_get("text")?,
        screenshot: screenshot
            .map(|json| serde_json::from_str::<Screenshot>(&json))
            .transpose()
            .context("Failed to parse stored screenshot")?,
        timestamp: from_millis(row.try_get("timestamp")?, "message")?,
        provider_used: provider_used.map(|p| p.parse()).transpose()?,
        model_used: row.try_get("model_used")?,
        status: status.parse()?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(
        &self,
        provider: ProviderId,
        model: &str,
        project_id: Option<Uuid>,
    ) -> Result<Conversation> {
        log::info!("Creating new conversation for {} / {}", provider, model);
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: None,
            messages: Vec::new(),
            provider,
            model: model.to_string(),
            project_id,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, provider, model, project_id, created_at, updated_at)
            VALUES (?, NULL, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(provider.as_str())
        .bind(&conversation.model)
        .bind(project_id.map(|p| p.to_string()))
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new conversation into database")?;

        log::info!("Successfully created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    async fn append_message(&self, conversation_id: Uuid, message: &Message) -> Result<Conversation> {
        log::debug!("Saving message ID: {} to conversation: {}", message.id, conversation_id);
        let conversation_id_text = conversation_id.to_string();
        let screenshot_json = message
            .screenshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize screenshot")?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let existing_title: Option<Option<String>> =
            sqlx::query_scalar("SELECT title FROM conversations WHERE id = ?")
                .bind(&conversation_id_text)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to look up conversation")?;
        let Some(existing_title) = existing_title else {
            return Err(anyhow::anyhow!("Conversation {} not found", conversation_id));
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, text, screenshot, timestamp, provider_used, model_used, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(&conversation_id_text)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(screenshot_json)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.provider_used.map(ProviderId::as_str))
        .bind(message.model_used.as_deref())
        .bind(message.status.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        // The title is taken from the first user text and never overwritten
        let title = match existing_title {
            Some(title) => Some(title),
            None if message.role == Role::User => derive_title(&message.text),
            None => None,
        };
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now().timestamp_millis())
            .bind(&conversation_id_text)
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation after append")?;

        tx.commit().await.context("Failed to commit message")?;
        log::info!("Successfully saved message ID: {}", message.id);

        self.get_conversation(conversation_id)
            .await?
            .with_context(|| format!("Conversation {} vanished after append", conversation_id))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        log::debug!("Fetching conversation with ID: {}", conversation_id);
        let row = sqlx::query(
            r#"
            SELECT id, title, provider, model, project_id, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation from database")?;

        match row {
            Some(r) => {
                let mut conversation = conversation_from_row(&r)?;
                conversation.messages = self.load_messages(conversation_id).await?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        log::debug!("Fetching all conversations from database");
        let rows = sqlx::query(
            r#"
            SELECT id, title, provider, model, project_id, created_at, updated_at
            FROM conversations
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversations from database")?;

        let conversations = rows.iter().map(conversation_from_row).collect::<Result<Vec<_>>>()?;
        log::info!("Fetched {} conversations", conversations.len());
        Ok(conversations)
    }

    async fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool> {
        log::warn!("Deleting conversation with ID: {}", conversation_id);
        // Messages go with it through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
            return Ok(false);
        }
        Ok(true)
    }
}
