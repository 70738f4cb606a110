//! Channel membership -- A4, thin.
//!
//! Channel/document CRUD proper is an external surface this core does not
//! own; the core only needs enough of it to validate
//! `enterChannel`/edit intents against an existing membership row. No
//! policy beyond uniqueness and membership existence is implemented here.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn create_channel(&self, name: &str, owner_id: Uuid) -> Result<Channel>;
    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn quit_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn list_channels_for_user(&self, user_id: Uuid) -> Result<Vec<Channel>>;
    async fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool>;
}

pub struct PgChannelService {
    pool: PgPool,
}

impl PgChannelService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelService for PgChannelService {
    async fn create_channel(&self, name: &str, owner_id: Uuid) -> Result<Channel> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO channel (id, name, owner_id, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(name)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.join_channel(id, owner_id).await?;
                Ok(Channel {
                    id,
                    name: name.to_string(),
                    owner_id,
                    created_at: now,
                })
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(AppError::Conflict(format!("channel {name} already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_membership (channel_id, user_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(channel_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn quit_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM channel_membership WHERE channel_id = $1 AND user_id = $2")
            .bind(channel_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_channels_for_user(&self, user_id: Uuid) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, (Uuid, String, Uuid, DateTime<Utc>)>(
            "SELECT c.id, c.name, c.owner_id, c.created_at FROM channel c \
             JOIN channel_membership m ON m.channel_id = c.id WHERE m.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, owner_id, created_at)| Channel {
                id,
                name,
                owner_id,
                created_at,
            })
            .collect())
    }

    async fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        let row = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM channel_membership WHERE channel_id = $1 AND user_id = $2",
        )
        .bind(channel_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row > 0)
    }
}

/// In-memory fake for tests.
#[derive(Default)]
pub struct InMemoryChannelService {
    channels: Arc<parking_lot::RwLock<Vec<Channel>>>,
    memberships: Arc<parking_lot::RwLock<HashSet<(Uuid, Uuid)>>>,
}

impl InMemoryChannelService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelService for InMemoryChannelService {
    async fn create_channel(&self, name: &str, owner_id: Uuid) -> Result<Channel> {
        let mut channels = self.channels.write();
        if channels.iter().any(|c| c.name == name) {
            return Err(AppError::Conflict(format!("channel {name} already exists")));
        }
        let channel = Channel {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id,
            created_at: Utc::now(),
        };
        channels.push(channel.clone());
        self.memberships.write().insert((channel.id, owner_id));
        Ok(channel)
    }

    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        self.memberships.write().insert((channel_id, user_id));
        Ok(())
    }

    async fn quit_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        self.memberships.write().remove(&(channel_id, user_id));
        Ok(())
    }

    async fn list_channels_for_user(&self, user_id: Uuid) -> Result<Vec<Channel>> {
        let memberships = self.memberships.read();
        Ok(self
            .channels
            .read()
            .iter()
            .filter(|c| memberships.contains(&(c.id, user_id)))
            .cloned()
            .collect())
    }

    async fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self.memberships.read().contains(&(channel_id, user_id)))
    }
}
