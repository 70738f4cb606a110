//! Lifecycle controller -- C10.
//!
//! Owns the state machine transitions that fall outside a single edit:
//! lock/unlock, last-viewer write-through, owner-initiated snapshot and
//! sync, and process startup/shutdown.

use crate::broadcast::{Broadcaster, RoomKind};
use crate::cache::DocumentCache;
use crate::document::{Document, DocumentStatus};
use crate::error::{AppError, Result};
use crate::registry::SessionRegistry;
use crate::store::DurableStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct LifecycleController {
    registry: SessionRegistry,
    cache: Arc<dyn DocumentCache>,
    store: Arc<dyn DurableStore>,
    broadcaster: Broadcaster,
}

impl LifecycleController {
    pub fn new(
        registry: SessionRegistry,
        cache: Arc<dyn DocumentCache>,
        store: Arc<dyn DurableStore>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            broadcaster,
        }
    }

    /// `lockDoc(id, reason)`.
    pub async fn lock_doc(&self, doc_id: Uuid, reason: &str) -> Result<()> {
        let mut doc = self
            .cache
            .get(doc_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("document {doc_id}")))?;
        doc.status = DocumentStatus::Locked;
        self.cache.put(doc_id, doc).await;
        self.broadcaster.broadcast(
            doc_id,
            RoomKind::Doc,
            "docStatusChanged",
            json!({ "docId": doc_id, "locked": true, "reason": reason }),
            None,
        );
        Ok(())
    }

    /// `unlockDoc(id)`.
    pub async fn unlock_doc(&self, doc_id: Uuid) -> Result<()> {
        let mut doc = self
            .cache
            .get(doc_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("document {doc_id}")))?;
        doc.status = DocumentStatus::Normal;
        self.cache.put(doc_id, doc).await;
        self.broadcaster.broadcast(
            doc_id,
            RoomKind::Doc,
            "docStatusChanged",
            json!({ "docId": doc_id, "locked": false }),
            None,
        );
        Ok(())
    }

    /// `onLastViewerLeave(id)`. Called by the wire layer after detaching a
    /// session from the doc room, when `docUserCount` has just reached
    /// zero. Write-through failure is logged, not retried here -- the next
    /// snapshot or sync covers it.
    pub async fn on_last_viewer_leave(&self, doc_id: Uuid) {
        if self.registry.doc_user_count(doc_id) != 0 {
            return;
        }
        let Some(doc) = self.cache.get(doc_id).await else {
            return;
        };
        if let Err(err) = self.store.write_through(&doc).await {
            warn!(component = "lifecycle", %doc_id, error = %err, "write-through on last-viewer-leave failed");
        }
    }

    /// `snapshot(id)`, owner-initiated.
    pub async fn snapshot(&self, doc_id: Uuid) -> Result<Document> {
        self.lock_doc(doc_id, "snapshot in progress").await?;

        let mut doc = self
            .cache
            .get(doc_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("document {doc_id}")))?;
        self.store.write_through(&doc).await?;
        doc.snapshot_bump();
        self.store.snapshot(&doc).await?;
        self.cache.put(doc_id, doc.clone()).await;

        self.unlock_doc(doc_id).await?;
        self.broadcaster.broadcast(
            doc_id,
            RoomKind::Doc,
            "docSnapshotCreated",
            json!({
                "docId": doc_id,
                "version": doc.version.to_string(),
                "content": doc.content,
            }),
            None,
        );
        Ok(doc)
    }

    /// `sync(id)`, owner-initiated. Broadcasts to the document's channel,
    /// not just its own room, since sync is a channel-visible event.
    pub async fn sync(&self, doc_id: Uuid) -> Result<()> {
        self.lock_doc(doc_id, "sync in progress").await?;

        let doc = self
            .cache
            .get(doc_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("document {doc_id}")))?;
        self.store.write_through(&doc).await?;

        self.unlock_doc(doc_id).await?;
        self.broadcaster.broadcast(
            doc.channel_id,
            RoomKind::Channel,
            "docSyncCompleted",
            json!({ "docId": doc_id }),
            None,
        );
        Ok(())
    }

    /// Flush the hot tier (a stale cache from a prior crash must not be
    /// trusted) then prefetch every non-deleted document. A per-document
    /// prefetch failure is logged and does not block startup; that
    /// document loads lazily on first viewer instead.
    pub async fn startup(&self) -> Result<()> {
        self.cache.flush_all().await;
        let ids = self.store.list_non_deleted_ids().await?;
        info!(component = "lifecycle", count = ids.len(), "prefetching documents into hot tier");
        for id in ids {
            match self.store.load_doc(id).await {
                Ok(Some(doc)) => {
                    self.cache.put(id, doc).await;
                }
                Ok(None) => {
                    warn!(component = "lifecycle", %id, "document listed as non-deleted but missing on load");
                }
                Err(err) => {
                    error!(component = "lifecycle", %id, error = %err, "startup prefetch failed for document");
                }
            }
        }
        Ok(())
    }

    /// Write through every document with a live viewer, so in-progress
    /// edits survive process exit. Socket teardown and connection draining
    /// are owned by the wire layer; this is the data half of shutdown.
    pub async fn shutdown(&self, live_doc_ids: &[Uuid]) {
        for &id in live_doc_ids {
            let Some(doc) = self.cache.get(id).await else {
                continue;
            };
            if let Err(err) = self.store.write_through(&doc).await {
                error!(component = "lifecycle", %id, error = %err, "write-through during shutdown failed");
            }
        }
    }
}
