//! Durable store adapter -- C6.
//!
//! The relational store holds the authoritative row per document. This
//! module owns `loadDoc`/`writeThrough`/`snapshot`/`softDelete`/`rename`
//! and the rehydration policy that reconstructs a chunk list from a stored
//! row on a cache miss.

use crate::document::{replay, Chunk, ChunkStore, Document, DocumentStatus, OpLogEntry, Version};
use crate::error::{AppError, Result};
use crate::lseq::{between, LseqId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Adapter operations the lifecycle controller and dispatcher call against
/// the authoritative store. Implemented against Postgres; an in-memory
/// fake backs integration tests.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load_doc(&self, id: Uuid) -> Result<Option<Document>>;
    async fn write_through(&self, doc: &Document) -> Result<bool>;
    async fn snapshot(&self, doc: &Document) -> Result<()>;
    async fn soft_delete(&self, id: Uuid) -> Result<()>;
    async fn rename_move(&self, id: Uuid, name: Option<String>, parent_id: Option<Uuid>) -> Result<()>;
    async fn create_doc(&self, doc: &Document) -> Result<()>;
    /// Every non-deleted document id, for startup prefetch.
    async fn list_non_deleted_ids(&self) -> Result<Vec<Uuid>>;
    /// Non-deleted documents directly under `parent_id` within `channel_id`
    /// (`None` lists the channel root), for the `listDoc` wire event.
    async fn list_docs_for_channel(
        &self,
        channel_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<Vec<Document>>;
}

/// Postgres-backed implementation over `sqlx::PgPool`.
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| AppError::Fatal(format!("durable store unreachable at startup: {e}")))?;
        info!(component = "store", "durable store pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredRow> {
        let chunks_json: serde_json::Value = row.try_get("chunks")?;
        let op_log_json: serde_json::Value = row.try_get("op_log")?;
        Ok(StoredRow {
            id: row.try_get("id")?,
            channel_id: row.try_get("channel_id")?,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            is_directory: row.try_get("is_directory")?,
            status: row.try_get("status")?,
            content: row.try_get("content")?,
            chunks: serde_json::from_value(chunks_json).unwrap_or_default(),
            op_log: serde_json::from_value(op_log_json).unwrap_or_default(),
            version_service: row.try_get("version_service")?,
            version_snapshot: row.try_get("version_snapshot")?,
            version_log: row.try_get("version_log")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Row shape mirroring the `document_data` table.
struct StoredRow {
    id: Uuid,
    channel_id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
    is_directory: bool,
    status: i16,
    content: String,
    chunks: Vec<Chunk>,
    op_log: Vec<OpLogEntry>,
    version_service: i32,
    version_snapshot: i32,
    version_log: i32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StoredRow {
    fn version(&self) -> Version {
        Version {
            service: self.version_service as u32,
            snapshot: self.version_snapshot as u32,
            log: self.version_log as u32,
        }
    }

    /// Rehydration policy on cache miss: prefer a stored chunk
    /// snapshot; fall back to coalescing legacy per-character op-log
    /// entries; otherwise synthesize one chunk spanning `content`.
    fn reconstruct_chunks(&self) -> ChunkStore {
        if !self.chunks.is_empty() {
            return ChunkStore::from_sorted(self.chunks.clone());
        }
        if let Some(store) = coalesce_legacy_char_log(&self.op_log) {
            warn!(component = "store", id = %self.id, "rehydrated via legacy per-character op log");
            return store;
        }
        let mut store = ChunkStore::new();
        if !self.content.is_empty() {
            let id = between(None, None);
            // insert_with_id cannot fail against an empty store.
            let _ = store.insert_with_id(id, self.content.clone());
        }
        store
    }

    fn into_document(self) -> Document {
        let chunks = self.reconstruct_chunks();
        let mut doc = Document {
            id: self.id,
            channel_id: self.channel_id,
            name: self.name,
            parent_id: self.parent_id,
            is_directory: self.is_directory,
            status: DocumentStatus::from_i16(self.status).unwrap_or(DocumentStatus::Normal),
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version(),
            content: self.content,
            chunks,
            op_log: self.op_log,
        };
        doc.refresh_content();
        doc
    }
}

/// Legacy compatibility: if the op log contains per-character insert
/// entries whose ids are each a single component, coalesce consecutive
/// runs into chunks. Returns `None` when the log does not look legacy
/// (i.e. any entry is not a single-character insert), so the caller falls
/// through to the next rehydration tier.
fn coalesce_legacy_char_log(op_log: &[OpLogEntry]) -> Option<ChunkStore> {
    if op_log.is_empty() {
        return None;
    }
    let mut store = ChunkStore::new();
    for entry in op_log {
        match entry {
            OpLogEntry::Insert { id, text, .. } if text.chars().count() == 1 => {
                if store.insert_with_id(id.clone(), text.clone()).is_err() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(store)
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn load_doc(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, channel_id, name, parent_id, is_directory, status, content, chunks, \
             op_log, version_service, version_snapshot, version_log, created_by, created_at, \
             updated_at FROM document_data WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let stored = Self::row_to_stored(&row)?;
                Ok(Some(stored.into_document()))
            }
            None => Ok(None),
        }
    }

    async fn write_through(&self, doc: &Document) -> Result<bool> {
        let existing = sqlx::query("SELECT version_service, version_snapshot, version_log FROM document_data WHERE id = $1")
            .bind(doc.id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = existing {
            let stored_version = Version {
                service: row.try_get::<i32, _>("version_service")? as u32,
                snapshot: row.try_get::<i32, _>("version_snapshot")? as u32,
                log: row.try_get::<i32, _>("version_log")? as u32,
            };
            // Invariant 7: only write when the cached version strictly
            // exceeds the stored version.
            if doc.version.compare(&stored_version) != std::cmp::Ordering::Greater {
                return Ok(false);
            }
        }

        let chunks_json = serde_json::to_value(doc.chunks.chunks())
            .map_err(|e| AppError::Validation(format!("failed to serialize chunks: {e}")))?;
        let op_log_json = serde_json::to_value(&doc.op_log)
            .map_err(|e| AppError::Validation(format!("failed to serialize op log: {e}")))?;

        sqlx::query(
            "UPDATE document_data SET content = $2, chunks = $3, op_log = $4, \
             version_service = $5, version_snapshot = $6, version_log = $7, updated_at = $8 \
             WHERE id = $1",
        )
        .bind(doc.id)
        .bind(&doc.content)
        .bind(chunks_json)
        .bind(op_log_json)
        .bind(doc.version.service as i32)
        .bind(doc.version.snapshot as i32)
        .bind(doc.version.log as i32)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn snapshot(&self, doc: &Document) -> Result<()> {
        let chunks_json = serde_json::to_value(doc.chunks.chunks())
            .map_err(|e| AppError::Validation(format!("failed to serialize chunks: {e}")))?;

        sqlx::query(
            "UPDATE document_data SET content = $2, chunks = $3, op_log = '[]', \
             version_service = $4, version_snapshot = $5, version_log = 0, updated_at = $6 \
             WHERE id = $1",
        )
        .bind(doc.id)
        .bind(&doc.content)
        .bind(chunks_json)
        .bind(doc.version.service as i32)
        .bind(doc.version.snapshot as i32)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE document_data SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(DocumentStatus::Deleted.as_i16())
            .execute(&self.pool)
            .await?;
        info!(component = "store", %id, "document soft-deleted");
        Ok(())
    }

    async fn rename_move(&self, id: Uuid, name: Option<String>, parent_id: Option<Uuid>) -> Result<()> {
        let row = sqlx::query("SELECT channel_id, name, parent_id FROM document_data WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;

        let channel_id: Uuid = row.try_get("channel_id")?;
        let new_name = name.unwrap_or(row.try_get("name")?);
        let new_parent: Option<Uuid> = parent_id.or(row.try_get("parent_id")?);

        let clash = sqlx::query(
            "SELECT 1 FROM document_data WHERE channel_id = $1 AND parent_id IS NOT DISTINCT FROM $2 \
             AND name = $3 AND id != $4",
        )
        .bind(channel_id)
        .bind(new_parent)
        .bind(&new_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if clash.is_some() {
            return Err(AppError::Conflict(format!(
                "a document named {new_name} already exists in that location"
            )));
        }

        sqlx::query(
            "UPDATE document_data SET name = $2, parent_id = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(&new_name)
        .bind(new_parent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_doc(&self, doc: &Document) -> Result<()> {
        let chunks_json = serde_json::to_value(doc.chunks.chunks())
            .map_err(|e| AppError::Validation(format!("failed to serialize chunks: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO document_data (id, channel_id, name, parent_id, is_directory, status, \
             content, chunks, op_log, version_service, version_snapshot, version_log, \
             created_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]', $9, $10, $11, $12, $13, $14)",
        )
        .bind(doc.id)
        .bind(doc.channel_id)
        .bind(&doc.name)
        .bind(doc.parent_id)
        .bind(doc.is_directory)
        .bind(doc.status.as_i16())
        .bind(&doc.content)
        .bind(chunks_json)
        .bind(doc.version.service as i32)
        .bind(doc.version.snapshot as i32)
        .bind(doc.version.log as i32)
        .bind(doc.created_by)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(
                format!("a document named {} already exists in that location", doc.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_non_deleted_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM document_data WHERE status != $1")
            .bind(DocumentStatus::Deleted.as_i16())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.try_get("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn list_docs_for_channel(
        &self,
        channel_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, name, parent_id, is_directory, status, content, chunks, \
             op_log, version_service, version_snapshot, version_log, created_by, created_at, \
             updated_at FROM document_data \
             WHERE channel_id = $1 AND parent_id IS NOT DISTINCT FROM $2 AND status != $3",
        )
        .bind(channel_id)
        .bind(parent_id)
        .bind(DocumentStatus::Deleted.as_i16())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(Self::row_to_stored)
            .map(|r| r.map(StoredRow::into_document))
            .collect()
    }
}

/// In-memory fake for integration tests, matching `DurableStore`'s
/// contract (including the monotone-version write guard) without a live
/// Postgres instance.
#[derive(Default)]
pub struct InMemoryDurableStore {
    rows: Arc<parking_lot::RwLock<std::collections::HashMap<Uuid, Document>>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn load_doc(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn write_through(&self, doc: &Document) -> Result<bool> {
        let mut rows = self.rows.write();
        if let Some(existing) = rows.get(&doc.id) {
            if doc.version.compare(&existing.version) != std::cmp::Ordering::Greater {
                return Ok(false);
            }
        }
        rows.insert(doc.id, doc.clone());
        Ok(true)
    }

    async fn snapshot(&self, doc: &Document) -> Result<()> {
        let mut rows = self.rows.write();
        let mut snapshotted = doc.clone();
        snapshotted.op_log.clear();
        rows.insert(doc.id, snapshotted);
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write();
        if let Some(doc) = rows.get_mut(&id) {
            doc.status = DocumentStatus::Deleted;
        } else {
            return Err(AppError::NotFound(format!("document {id}")));
        }
        Ok(())
    }

    async fn rename_move(&self, id: Uuid, name: Option<String>, parent_id: Option<Uuid>) -> Result<()> {
        let mut rows = self.rows.write();
        let (channel_id, new_name, new_parent) = {
            let doc = rows
                .get(&id)
                .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;
            (
                doc.channel_id,
                name.unwrap_or_else(|| doc.name.clone()),
                parent_id.or(doc.parent_id),
            )
        };
        let clash = rows
            .values()
            .any(|d| d.id != id && d.channel_id == channel_id && d.parent_id == new_parent && d.name == new_name);
        if clash {
            return Err(AppError::Conflict(format!(
                "a document named {new_name} already exists in that location"
            )));
        }
        let doc = rows.get_mut(&id).unwrap();
        doc.name = new_name;
        doc.parent_id = new_parent;
        Ok(())
    }

    async fn create_doc(&self, doc: &Document) -> Result<()> {
        let mut rows = self.rows.write();
        let clash = rows
            .values()
            .any(|d| d.channel_id == doc.channel_id && d.parent_id == doc.parent_id && d.name == doc.name);
        if clash {
            return Err(AppError::Conflict(format!(
                "a document named {} already exists in that location", doc.name
            )));
        }
        rows.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn list_non_deleted_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|d| d.status != DocumentStatus::Deleted)
            .map(|d| d.id)
            .collect())
    }

    async fn list_docs_for_channel(
        &self,
        channel_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<Vec<Document>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|d| {
                d.channel_id == channel_id && d.parent_id == parent_id && d.status != DocumentStatus::Deleted
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> Document {
        Document::new_leaf(Uuid::new_v4(), "a.txt".into(), None, Uuid::new_v4(), 1)
    }

    #[tokio::test]
    async fn write_through_then_load_round_trips() {
        let store = InMemoryDurableStore::new();
        let mut doc = leaf();
        store.create_doc(&doc).await.unwrap();
        doc.chunks.insert_chunk(None, None, "hi".into()).unwrap();
        doc.refresh_content();
        doc.version = doc.version.bump_log();
        assert!(store.write_through(&doc).await.unwrap());

        let loaded = store.load_doc(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "hi");
        assert_eq!(loaded.version, doc.version);
    }

    #[tokio::test]
    async fn write_through_rejects_non_increasing_version() {
        let store = InMemoryDurableStore::new();
        let doc = leaf();
        store.create_doc(&doc).await.unwrap();
        // Same version as stored: must not write (invariant 7).
        assert!(!store.write_through(&doc).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_then_replay_of_emptied_log_is_identity() {
        let store = InMemoryDurableStore::new();
        let mut doc = leaf();
        store.create_doc(&doc).await.unwrap();
        doc.chunks.insert_chunk(None, None, "hi".into()).unwrap();
        doc.refresh_content();
        doc.append_op(OpLogEntry::Insert {
            id: doc.chunks.chunks()[0].id.clone(),
            text: "hi".into(),
            left_id: None,
            right_id: None,
            user_id: doc.created_by,
            at: Utc::now(),
        });
        doc.snapshot_bump();
        store.snapshot(&doc).await.unwrap();

        let loaded = store.load_doc(doc.id).await.unwrap().unwrap();
        assert!(loaded.op_log.is_empty());
        let replayed = replay(loaded.chunks.chunks().to_vec(), &loaded.op_log);
        assert_eq!(replayed.chunks(), loaded.chunks.chunks());
    }

    #[tokio::test]
    async fn create_doc_rejects_duplicate_name_under_same_parent() {
        let store = InMemoryDurableStore::new();
        let doc1 = leaf();
        let mut doc2 = leaf();
        doc2.channel_id = doc1.channel_id;
        doc2.name = doc1.name.clone();
        store.create_doc(&doc1).await.unwrap();
        let err = store.create_doc(&doc2).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn list_docs_for_channel_excludes_other_channels_and_deleted_docs() {
        let store = InMemoryDurableStore::new();
        let wanted = leaf();
        let mut other_channel = leaf();
        other_channel.channel_id = Uuid::new_v4();
        let mut deleted = leaf();
        deleted.channel_id = wanted.channel_id;
        deleted.name = "gone.txt".into();

        store.create_doc(&wanted).await.unwrap();
        store.create_doc(&other_channel).await.unwrap();
        store.create_doc(&deleted).await.unwrap();
        store.soft_delete(deleted.id).await.unwrap();

        let listed = store.list_docs_for_channel(wanted.channel_id, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, wanted.id);
    }

    #[tokio::test]
    async fn soft_delete_marks_status_deleted_and_excludes_from_prefetch_list() {
        let store = InMemoryDurableStore::new();
        let doc = leaf();
        store.create_doc(&doc).await.unwrap();
        store.soft_delete(doc.id).await.unwrap();
        let ids = store.list_non_deleted_ids().await.unwrap();
        assert!(!ids.contains(&doc.id));
    }

    #[test]
    fn reconstruct_chunks_prefers_stored_snapshot() {
        let row = StoredRow {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            name: "a".into(),
            parent_id: None,
            is_directory: false,
            status: 0,
            content: "hi".into(),
            chunks: vec![Chunk {
                id: LseqId::from_components(vec![10]),
                text: "hi".into(),
            }],
            op_log: Vec::new(),
            version_service: 1,
            version_snapshot: 0,
            version_log: 0,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = row.reconstruct_chunks();
        assert_eq!(store.render(), "hi");
    }

    #[test]
    fn reconstruct_chunks_falls_back_to_legacy_char_log_then_single_chunk() {
        let base = StoredRow {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            name: "a".into(),
            parent_id: None,
            is_directory: false,
            status: 0,
            content: "hi".into(),
            chunks: Vec::new(),
            op_log: vec![
                OpLogEntry::Insert {
                    id: LseqId::from_components(vec![1]),
                    text: "h".into(),
                    left_id: None,
                    right_id: None,
                    user_id: Uuid::new_v4(),
                    at: Utc::now(),
                },
                OpLogEntry::Insert {
                    id: LseqId::from_components(vec![2]),
                    text: "i".into(),
                    left_id: None,
                    right_id: None,
                    user_id: Uuid::new_v4(),
                    at: Utc::now(),
                },
            ],
            version_service: 1,
            version_snapshot: 0,
            version_log: 2,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = base.reconstruct_chunks();
        assert_eq!(store.render(), "hi");

        let mut single_chunk_fallback = base;
        single_chunk_fallback.op_log.clear();
        let store = single_chunk_fallback.reconstruct_chunks();
        assert_eq!(store.render(), "hi");
        assert_eq!(store.chunks().len(), 1);
    }
}
