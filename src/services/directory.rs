//! Directory collaborator: identity lookup, room memberships and key
//! material. The gateway consumes this as a black box; account creation and
//! token issuance live upstream.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{Identity, KeyPair, Room};
use crate::services::encryption::EncryptionManager;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn identity_by_id(&self, user_id: i64) -> Result<Option<Identity>, AppError>;

    async fn identity_by_username(&self, username: &str) -> Result<Option<Identity>, AppError>;

    /// Rooms the user is a member of.
    async fn rooms_for(&self, user_id: i64) -> Result<Vec<Room>, AppError>;

    /// Key pair for an identity, generated on first use.
    ///
    /// Must be idempotent: once a pair exists it is always returned as-is.
    /// Regenerating would make the user's message history undecryptable.
    async fn keypair_for(&self, user_id: i64) -> Result<KeyPair, AppError>;

    /// Best-effort presence flag on the directory record.
    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), AppError>;
}

pub struct PgDirectory {
    db: Pool,
    crypto: Arc<EncryptionManager>,
}

impl PgDirectory {
    pub fn new(db: Pool, crypto: Arc<EncryptionManager>) -> Self {
        Self { db, crypto }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn identity_by_id(&self, user_id: i64) -> Result<Option<Identity>, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_opt("SELECT id, username FROM users WHERE id = $1", &[&user_id])
            .await?;
        Ok(row.map(|r| Identity {
            id: r.get(0),
            username: r.get(1),
        }))
    }

    async fn identity_by_username(&self, username: &str) -> Result<Option<Identity>, AppError> {
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT id, username FROM users WHERE username = $1",
                &[&username],
            )
            .await?;
        Ok(row.map(|r| Identity {
            id: r.get(0),
            username: r.get(1),
        }))
    }

    async fn rooms_for(&self, user_id: i64) -> Result<Vec<Room>, AppError> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                SELECT r.id, r.is_group, r.name
                FROM chat_rooms r
                JOIN chat_room_memberships m ON m.chat_room_id = r.id
                WHERE m.user_id = $1
                ORDER BY r.id
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Room {
                id: r.get(0),
                is_group: r.get(1),
                name: r.get(2),
            })
            .collect())
    }

    async fn keypair_for(&self, user_id: i64) -> Result<KeyPair, AppError> {
        let client = self.db.get().await?;

        if let Some(row) = client
            .query_opt(
                "SELECT private_key, public_key FROM encryption_keys WHERE user_id = $1",
                &[&user_id],
            )
            .await?
        {
            return Ok(KeyPair {
                private_pem: row.get(0),
                public_pem: row.get(1),
            });
        }

        let fresh = self.crypto.generate_key_pair()?;

        // Two sessions may race to create the first pair; the conflict clause
        // keeps exactly one, and the re-read below returns the winner.
        client
            .execute(
                r#"
                INSERT INTO encryption_keys (user_id, private_key, public_key)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id) DO NOTHING
                "#,
                &[&user_id, &fresh.private_pem, &fresh.public_pem],
            )
            .await?;

        let row = client
            .query_one(
                "SELECT private_key, public_key FROM encryption_keys WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(KeyPair {
            private_pem: row.get(0),
            public_pem: row.get(1),
        })
    }

    async fn set_online(&self, user_id: i64, online: bool) -> Result<(), AppError> {
        let client = self.db.get().await?;
        client
            .execute(
                "UPDATE users SET is_online = $2, last_seen = now() WHERE id = $1",
                &[&user_id, &online],
            )
            .await?;
        Ok(())
    }
}
