use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted message row. `content` always holds the hybrid-encryption
/// envelope JSON, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: i64,
    pub room_id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_delivered: bool,
    pub is_read: bool,
}

impl StoredMessage {
    /// Client-facing view of this message.
    ///
    /// `content` is supplied by the caller because what goes out depends on
    /// context: the ciphertext envelope for fan-out, the decrypted plaintext
    /// for history and receipt display.
    pub fn view(&self, sender_username: &str, content: String) -> MessageView {
        MessageView {
            id: self.id,
            sender: sender_username.to_string(),
            content,
            timestamp: self.timestamp,
            is_read: self.is_read,
            is_delivered: self.is_delivered,
            chat_room: self.room_id,
        }
    }
}

/// Wire shape shared by `chat_history`, `chat_message` and receipt frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub is_delivered: bool,
    pub chat_room: i64,
}
