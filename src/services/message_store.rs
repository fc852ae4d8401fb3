//! Message store collaborator: durable, ordered persistence per room.
//!
//! Storage is the system of record for receipt ordering: a delivered/read
//! flip is applied here before the corresponding broadcast goes out, so a
//! crash between the two leaves storage consistent.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::error::AppError;
use crate::models::StoredMessage;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message in the undelivered/unread state.
    /// `ciphertext` is the serialized envelope, never plaintext.
    async fn create(
        &self,
        sender_id: i64,
        room_id: i64,
        ciphertext: &str,
    ) -> Result<StoredMessage, AppError>;

    /// Look up a single message by id.
    async fn get(&self, message_id: i64) -> Result<Option<StoredMessage>, AppError>;

    /// Flip `is_delivered` to true. Monotonic: never resets.
    async fn set_delivered(&self, message_id: i64) -> Result<StoredMessage, AppError>;

    /// Flip `is_read` to true. Monotonic, and independent of `is_delivered`.
    async fn set_read(&self, message_id: i64) -> Result<StoredMessage, AppError>;

    /// All messages for a room in chronological order.
    async fn history(&self, room_id: i64) -> Result<Vec<StoredMessage>, AppError>;
}

pub struct PgMessageStore {
    db: Pool,
}

impl PgMessageStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }

    fn row_to_message(row: &Row) -> StoredMessage {
        StoredMessage {
            id: row.get(0),
            sender_id: row.get(1),
            room_id: row.get(2),
            content: row.get(3),
            timestamp: row.get(4),
            is_delivered: row.get(5),
            is_read: row.get(6),
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, sender_id, chat_room_id, content, timestamp, is_delivered, is_read";

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(
        &self,
        sender_id: i64,
        room_id: i64,
        ciphertext: &str,
    ) -> Result<StoredMessage, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO messages (sender_id, chat_room_id, content) \
                     VALUES ($1, $2, $3) RETURNING {MESSAGE_COLUMNS}"
                )
                .as_str(),
                &[&sender_id, &room_id, &ciphertext],
            )
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(Self::row_to_message(&row))
    }

    async fn get(&self, message_id: i64) -> Result<Option<StoredMessage>, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1").as_str(),
                &[&message_id],
            )
            .await?;
        Ok(row.map(|r| Self::row_to_message(&r)))
    }

    async fn set_delivered(&self, message_id: i64) -> Result<StoredMessage, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE messages SET is_delivered = TRUE WHERE id = $1 \
                     RETURNING {MESSAGE_COLUMNS}"
                )
                .as_str(),
                &[&message_id],
            )
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        row.map(|r| Self::row_to_message(&r))
            .ok_or(AppError::MessageNotFound(message_id))
    }

    async fn set_read(&self, message_id: i64) -> Result<StoredMessage, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE messages SET is_read = TRUE WHERE id = $1 \
                     RETURNING {MESSAGE_COLUMNS}"
                )
                .as_str(),
                &[&message_id],
            )
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        row.map(|r| Self::row_to_message(&r))
            .ok_or(AppError::MessageNotFound(message_id))
    }

    async fn history(&self, room_id: i64) -> Result<Vec<StoredMessage>, AppError> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_room_id = $1 ORDER BY timestamp, id"
                )
                .as_str(),
                &[&room_id],
            )
            .await?;
        Ok(rows.iter().map(Self::row_to_message).collect())
    }
}
