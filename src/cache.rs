//! Document cache (hot tier) -- C5.
//!
//! Abstracts a shared external key-value layer keyed by document id. The
//! trait is implemented once against Redis; tests substitute an in-memory
//! fake. Every method degrades to its documented fallback (`None` for
//! reads, `false` for writes) rather than propagating an error when the
//! backing store is unreachable -- live editors on already-cached
//! documents must keep working.

use crate::document::Document;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// A mutator applied by `update`. Not required to be atomic across the
/// network -- the dispatcher is responsible for serializing writes to a
/// given document at the process level (see the per-document write lane in
/// `dispatcher`).
pub type Mutator<'a> = Box<dyn FnOnce(&mut Document) + Send + 'a>;

#[async_trait]
pub trait DocumentCache: Send + Sync {
    async fn get(&self, id: Uuid) -> Option<Document>;
    async fn put(&self, id: Uuid, record: Document) -> bool;
    async fn delete(&self, id: Uuid) -> bool;
    /// Read-modify-write: loads the record, applies `mutator`, writes it
    /// back. Returns the updated record, or `None` if the record was
    /// absent or the backing store is unreachable.
    async fn update(&self, id: Uuid, mutator: Mutator<'_>) -> Option<Document>;
    /// Drop every entry. Called once at process startup: a stale cache from
    /// a prior crash must not be trusted.
    async fn flush_all(&self) -> bool;
}

fn cache_key(id: Uuid) -> String {
    format!("doc:{id}")
}

/// Redis-backed implementation using a `ConnectionManager`, which
/// reconnects automatically and queues requests across transient drops
/// rather than requiring the caller to re-dial.
pub struct RedisDocumentCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisDocumentCache {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DocumentCache for RedisDocumentCache {
    async fn get(&self, id: Uuid) -> Option<Document> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(cache_key(id)).await {
            Ok(v) => v,
            Err(err) => {
                warn!(component = "cache", error = %err, "hot tier get failed, degrading to absent");
                return None;
            }
        };
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn put(&self, id: Uuid, record: Document) -> bool {
        let mut conn = self.conn.clone();
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(component = "cache", error = %err, "failed to serialize document for cache put");
                return false;
            }
        };
        match conn.set::<_, _, ()>(cache_key(id), raw).await {
            Ok(()) => true,
            Err(err) => {
                warn!(component = "cache", error = %err, "hot tier put failed");
                false
            }
        }
    }

    async fn delete(&self, id: Uuid) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, ()>(cache_key(id)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(component = "cache", error = %err, "hot tier delete failed");
                false
            }
        }
    }

    async fn update(&self, id: Uuid, mutator: Mutator<'_>) -> Option<Document> {
        let mut record = self.get(id).await?;
        mutator(&mut record);
        if self.put(id, record.clone()).await {
            Some(record)
        } else {
            None
        }
    }

    async fn flush_all(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("FLUSHDB")
            .query_async::<_, ()>(&mut conn)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(component = "cache", error = %err, "hot tier flush failed");
                false
            }
        }
    }
}

/// In-memory fake used by integration tests and by `Config`-less unit
/// tests that do not stand up a real Redis instance.
#[derive(Default, Clone)]
pub struct InMemoryDocumentCache {
    inner: Arc<parking_lot::RwLock<std::collections::HashMap<Uuid, Document>>>,
}

impl InMemoryDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentCache for InMemoryDocumentCache {
    async fn get(&self, id: Uuid) -> Option<Document> {
        self.inner.read().get(&id).cloned()
    }

    async fn put(&self, id: Uuid, record: Document) -> bool {
        self.inner.write().insert(id, record);
        true
    }

    async fn delete(&self, id: Uuid) -> bool {
        self.inner.write().remove(&id);
        true
    }

    async fn update(&self, id: Uuid, mutator: Mutator<'_>) -> Option<Document> {
        let mut guard = self.inner.write();
        let record = guard.get_mut(&id)?;
        mutator(record);
        Some(record.clone())
    }

    async fn flush_all(&self) -> bool {
        self.inner.write().clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = InMemoryDocumentCache::new();
        let doc = Document::new_leaf(Uuid::new_v4(), "a.txt".into(), None, Uuid::new_v4(), 1);
        let id = doc.id;
        assert!(cache.put(id, doc.clone()).await);
        let fetched = cache.get(id).await.unwrap();
        assert_eq!(fetched.id, doc.id);
    }

    #[tokio::test]
    async fn get_on_absent_id_is_none() {
        let cache = InMemoryDocumentCache::new();
        assert!(cache.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn update_applies_mutator_and_persists() {
        let cache = InMemoryDocumentCache::new();
        let doc = Document::new_leaf(Uuid::new_v4(), "a.txt".into(), None, Uuid::new_v4(), 1);
        let id = doc.id;
        cache.put(id, doc).await;
        let updated = cache
            .update(id, Box::new(|d| d.content = "changed".into()))
            .await
            .unwrap();
        assert_eq!(updated.content, "changed");
        assert_eq!(cache.get(id).await.unwrap().content, "changed");
    }

    #[tokio::test]
    async fn update_on_absent_id_returns_none() {
        let cache = InMemoryDocumentCache::new();
        assert!(cache
            .update(Uuid::new_v4(), Box::new(|_| {}))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn flush_all_clears_every_entry() {
        let cache = InMemoryDocumentCache::new();
        let doc = Document::new_leaf(Uuid::new_v4(), "a.txt".into(), None, Uuid::new_v4(), 1);
        cache.put(doc.id, doc).await;
        assert!(cache.flush_all().await);
        assert_eq!(cache.inner.read().len(), 0);
    }
}
