//! In-memory directory and message store.
//!
//! These back the integration tests (and local experiments) with the same
//! contracts the Postgres implementations honor, including the monotonic
//! receipt flags and generate-on-first-use key pairs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::models::{Identity, KeyPair, Membership, Room, StoredMessage};
use crate::services::directory::Directory;
use crate::services::encryption::EncryptionManager;
use crate::services::message_store::MessageStore;

#[derive(Default)]
struct DirectoryState {
    users: Vec<Identity>,
    rooms: Vec<Room>,
    memberships: Vec<Membership>,
    keys: HashMap<i64, KeyPair>,
    online: HashMap<i64, bool>,
}

pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    crypto: Arc<EncryptionManager>,
}

impl MemoryDirectory {
    pub fn new(crypto: Arc<EncryptionManager>) -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            crypto,
        }
    }

    pub fn add_user(&self, id: i64, username: &str) {
        let mut state = self.state.lock().unwrap();
        state.users.push(Identity {
            id,
            username: username.to_string(),
        });
    }

    pub fn add_room(&self, id: i64, is_group: bool, member_ids: &[i64]) {
        let mut state = self.state.lock().unwrap();
        state.rooms.push(Room {
            id,
            is_group,
            name: None,
        });
        for &user_id in member_ids {
            state.memberships.push(Membership {
                user_id,
                room_id: id,
                joined_at: Utc::now(),
            });
        }
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        let state = self.state.lock().unwrap();
        state.online.get(&user_id).copied().unwrap_or(false)
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn identity_by_id(&self, user_id: i64) -> Result<Option<Identity>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn identity_by_username(&self, username: &str) -> Result<Option<Identity>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.username == username).cloned())
    }

    async fn rooms_for(&self, user_id: i64) -> Result<Vec<Room>, AppError> {
        let state = self.state.lock().unwrap();
        let mut rooms: Vec<Room> = state
            .rooms
            .iter()
            .filter(|r| {
                state
                    .memberships
                    .iter()
                    .any(|m| m.room_id == r.id && m.user_id == user_id)
            })
            .cloned()
            .collect();
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    async fn keypair_for(&self, user_id: i64) -> Result<KeyPair, AppError> {
        // Generate outside the lock; the entry check makes the insert
        // first-writer-wins, matching the Postgres conflict clause.
        let fresh = {
            let state = self.state.lock().unwrap();
            if let Some(pair) = state.keys.get(&user_id) {
                return Ok(pair.clone());
            }
            drop(state);
            self.crypto.generate_key_pair()?
        };

        let mut state = self.state.lock().unwrap();
        Ok(state.keys.entry(user_id).or_insert(fresh).clone())
    }

    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.online.insert(user_id, online);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
    next_id: AtomicI64,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(
        &self,
        sender_id: i64,
        room_id: i64,
        ciphertext: &str,
    ) -> Result<StoredMessage, AppError> {
        let message = StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            sender_id,
            room_id,
            content: ciphertext.to_string(),
            timestamp: Utc::now(),
            is_delivered: false,
            is_read: false,
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn get(&self, message_id: i64) -> Result<Option<StoredMessage>, AppError> {
        let messages = self.messages.lock().unwrap();
        Ok(messages.iter().find(|m| m.id == message_id).cloned())
    }

    async fn set_delivered(&self, message_id: i64) -> Result<StoredMessage, AppError> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(AppError::MessageNotFound(message_id))?;
        message.is_delivered = true;
        Ok(message.clone())
    }

    async fn set_read(&self, message_id: i64) -> Result<StoredMessage, AppError> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(AppError::MessageNotFound(message_id))?;
        message.is_read = true;
        Ok(message.clone())
    }

    async fn history(&self, room_id: i64) -> Result<Vec<StoredMessage>, AppError> {
        let messages = self.messages.lock().unwrap();
        let mut history: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receipt_flags_are_monotonic_and_independent() {
        let store = MemoryMessageStore::new();
        let msg = store.create(1, 7, "{}").await.unwrap();
        assert!(!msg.is_delivered && !msg.is_read);

        // read without a prior delivered transition is allowed
        let read = store.set_read(msg.id).await.unwrap();
        assert!(read.is_read);
        assert!(!read.is_delivered);

        let delivered = store.set_delivered(msg.id).await.unwrap();
        assert!(delivered.is_read, "read flag never resets");
        assert!(delivered.is_delivered);
    }

    #[tokio::test]
    async fn missing_message_is_reported() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            store.set_read(99).await,
            Err(AppError::MessageNotFound(99))
        ));
    }

    #[tokio::test]
    async fn keypair_is_generated_once_and_reused() {
        let crypto = Arc::new(EncryptionManager::new(1024));
        let dir = MemoryDirectory::new(crypto);
        dir.add_user(1, "alice");

        let first = dir.keypair_for(1).await.unwrap();
        let second = dir.keypair_for(1).await.unwrap();
        assert_eq!(first.private_pem, second.private_pem);
        assert_eq!(first.public_pem, second.public_pem);
    }
}
