//! Edit dispatcher -- C9.
//!
//! Entry points for `editDoc` and `editDocBatch`. The dispatcher never
//! raises for expected, client-visible outcomes (validation failure,
//! `editRejected`, `alreadyDeleted`) -- those come back as a tagged
//! `EditOutcome` the wire layer renders directly. Only truly unexpected
//! failures (cache/store I/O) surface as `AppError`.

use crate::broadcast::{Broadcaster, RoomKind};
use crate::cache::DocumentCache;
use crate::document::{ChunkStoreError, DeleteOutcome, Document, DocumentStatus, OpLogEntry};
use crate::error::Result;
use crate::lseq::LseqId;
use crate::protocol::Envelope;
use crate::registry::{SessionId, SessionRegistry};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// The single-character legacy intent carried by `editDoc`.
#[derive(Debug, Clone)]
pub enum EditIntent {
    Insert {
        left_id: Option<LseqId>,
        right_id: Option<LseqId>,
        value: String,
    },
    Delete {
        id: LseqId,
    },
}

/// A reference to a chunk id inside a batch: either a real id already in
/// the chunk list, or a `temp_N` placeholder resolved against ids
/// allocated earlier in the same batch.
#[derive(Debug, Clone)]
pub enum ChunkRef {
    Id(LseqId),
    Placeholder(String),
}

#[derive(Debug, Clone)]
pub enum BatchIntent {
    /// (a) bulk inter-chunk insert.
    BulkInsert {
        text: String,
        left_id: Option<ChunkRef>,
        right_id: Option<ChunkRef>,
    },
    /// (b) in-chunk split insert.
    SplitInsert {
        target_id: ChunkRef,
        offset: usize,
        text: String,
    },
    /// (c) primitive op sequence with placeholder resolution.
    Primitive(Vec<PrimitiveOp>),
}

#[derive(Debug, Clone)]
pub enum PrimitiveOp {
    Insert {
        temp_id: String,
        left_id: Option<ChunkRef>,
        right_id: Option<ChunkRef>,
        value: String,
    },
    Delete {
        id: ChunkRef,
    },
}

/// What the dispatcher produced, independent of whether it counts as
/// success for the purposes of the broadcast step.
pub enum EditOutcome {
    /// Chunks mutated, op log appended, broadcast pending.
    Applied {
        reply: Envelope,
        broadcast_event: &'static str,
        broadcast_payload: serde_json::Value,
    },
    /// `alreadyDeleted` or similar non-corrupting no-op; reply only.
    NoOp { reply: Envelope },
    /// `editRejected` -- first-class protocol message, not a general error.
    Rejected { reason: String },
    /// Validation/authorization/not-found failure -> `systemmessage`.
    SystemMessage { message: String },
}

pub struct Dispatcher {
    registry: SessionRegistry,
    cache: Arc<dyn DocumentCache>,
    broadcaster: Broadcaster,
    /// Per-document write lane: held across read-modify-write-append-bump
    /// so concurrent edits on one document serialize.
    write_lanes: DashMap<Uuid, Arc<AsyncMutex<()>>>,
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry, cache: Arc<dyn DocumentCache>, broadcaster: Broadcaster) -> Self {
        Self {
            registry,
            cache,
            broadcaster,
            write_lanes: DashMap::new(),
        }
    }

    fn lane_for(&self, doc_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.write_lanes
            .entry(doc_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Steps 1-2 of the validation pipeline, shared by single and batch
    /// edits: the session must be viewing `doc_id`, and the document must
    /// exist in `NORMAL` status.
    async fn load_and_authorize(
        &self,
        session_id: SessionId,
        doc_id: Uuid,
    ) -> std::result::Result<Document, EditOutcome> {
        let session = self.registry.session(session_id).ok_or_else(|| EditOutcome::SystemMessage {
            message: "session not found".into(),
        })?;
        if session.current_doc != Some(doc_id) {
            return Err(EditOutcome::SystemMessage {
                message: "not currently viewing this document".into(),
            });
        }
        let doc = self.cache.get(doc_id).await.ok_or_else(|| EditOutcome::SystemMessage {
            message: "document not found".into(),
        })?;
        match doc.status {
            DocumentStatus::Normal => Ok(doc),
            DocumentStatus::Locked => Err(EditOutcome::Rejected {
                reason: "document is locked".into(),
            }),
            DocumentStatus::Deleted => Err(EditOutcome::SystemMessage {
                message: "document has been deleted".into(),
            }),
        }
    }

    /// Write the mutated record back to the cache. Durable-store
    /// write-through is owned by the lifecycle controller, triggered on
    /// last-viewer departure, snapshot, or sync -- not here.
    async fn write_back(&self, doc: Document) {
        self.cache.put(doc.id, doc).await;
    }

    /// `editDoc` -- single-character legacy path.
    pub async fn edit_doc(
        &self,
        session_id: SessionId,
        doc_id: Uuid,
        intent: EditIntent,
    ) -> Result<EditOutcome> {
        let lane = self.lane_for(doc_id);
        let _guard = lane.lock().await;

        let mut doc = match self.load_and_authorize(session_id, doc_id).await {
            Ok(doc) => doc,
            Err(outcome) => return Ok(outcome),
        };
        let user_id = self
            .registry
            .session(session_id)
            .map(|s| s.user_id)
            .unwrap_or_default();

        match intent {
            EditIntent::Insert {
                left_id,
                right_id,
                value,
            } => {
                if value.chars().count() != 1 {
                    return Ok(EditOutcome::SystemMessage {
                        message: "insert value must be exactly one character".into(),
                    });
                }
                let chunk = match doc
                    .chunks
                    .insert_chunk(left_id.as_ref(), right_id.as_ref(), value.clone())
                {
                    Ok(c) => c,
                    Err(e) => return Ok(EditOutcome::SystemMessage { message: e.to_string() }),
                };
                doc.append_op(OpLogEntry::Insert {
                    id: chunk.id.clone(),
                    text: value.clone(),
                    left_id,
                    right_id,
                    user_id,
                    at: Utc::now(),
                });
                let payload = json!({
                    "docId": doc_id,
                    "op": { "kind": "insert", "id": chunk.id.render(), "text": value },
                    "logVersion": doc.version.to_string(),
                });
                self.write_back(doc).await;
                Ok(EditOutcome::Applied {
                    reply: Envelope::new("docOp", payload.clone()),
                    broadcast_event: "docOp",
                    broadcast_payload: payload,
                })
            }
            EditIntent::Delete { id } => {
                let target_text = doc
                    .chunks
                    .chunks()
                    .iter()
                    .find(|c| c.id == id)
                    .map(|c| c.text.clone());
                match doc.chunks.delete_chunk(&id) {
                    DeleteOutcome::AlreadyDeleted => Ok(EditOutcome::NoOp {
                        reply: Envelope::new(
                            "docOp",
                            json!({ "docId": doc_id, "op": { "kind": "alreadyDeleted", "id": id.render() } }),
                        ),
                    }),
                    DeleteOutcome::Deleted => {
                        doc.append_op(OpLogEntry::Delete {
                            id: id.clone(),
                            text: target_text.unwrap_or_default(),
                            user_id,
                            at: Utc::now(),
                        });
                        let payload = json!({
                            "docId": doc_id,
                            "op": { "kind": "delete", "id": id.render() },
                            "logVersion": doc.version.to_string(),
                        });
                        self.write_back(doc).await;
                        Ok(EditOutcome::Applied {
                            reply: Envelope::new("docOp", payload.clone()),
                            broadcast_event: "docOp",
                            broadcast_payload: payload,
                        })
                    }
                }
            }
        }
    }

    /// `editDocBatch` -- grouped intents with `temp_N` placeholder
    /// resolution for the primitive-sequence shape.
    pub async fn edit_doc_batch(
        &self,
        session_id: SessionId,
        doc_id: Uuid,
        intent: BatchIntent,
    ) -> Result<EditOutcome> {
        let lane = self.lane_for(doc_id);
        let _guard = lane.lock().await;

        let mut doc = match self.load_and_authorize(session_id, doc_id).await {
            Ok(doc) => doc,
            Err(outcome) => return Ok(outcome),
        };
        let user_id = self
            .registry
            .session(session_id)
            .map(|s| s.user_id)
            .unwrap_or_default();

        let mut ops_applied = Vec::new();

        match intent {
            BatchIntent::BulkInsert {
                text,
                left_id,
                right_id,
            } => {
                if text.is_empty() {
                    return Ok(EditOutcome::SystemMessage {
                        message: "insert text must be non-empty".into(),
                    });
                }
                let mut resolved = HashMap::new();
                let left = resolve_ref(&doc, &resolved, left_id.as_ref());
                let right = resolve_ref(&doc, &resolved, right_id.as_ref());
                let (left, right) = match (left, right) {
                    (Ok(l), Ok(r)) => (l, r),
                    _ => {
                        return Ok(EditOutcome::SystemMessage {
                            message: "unresolved chunk reference".into(),
                        })
                    }
                };
                let chunk = match doc.chunks.insert_chunk(left.as_ref(), right.as_ref(), text.clone()) {
                    Ok(c) => c,
                    Err(e) => return Ok(EditOutcome::SystemMessage { message: e.to_string() }),
                };
                resolved.insert("result".to_string(), chunk.id.clone());
                doc.append_op(OpLogEntry::Insert {
                    id: chunk.id.clone(),
                    text: text.clone(),
                    left_id: left,
                    right_id: right,
                    user_id,
                    at: Utc::now(),
                });
                ops_applied.push(json!({ "kind": "insert", "id": chunk.id.render(), "text": text }));
            }
            BatchIntent::SplitInsert {
                target_id,
                offset,
                text,
            } => {
                if text.is_empty() {
                    return Ok(EditOutcome::SystemMessage {
                        message: "split insert text must be non-empty".into(),
                    });
                }
                let target = match resolve_ref(&doc, &HashMap::new(), Some(&target_id)) {
                    Ok(Some(id)) => id,
                    _ => {
                        return Ok(EditOutcome::SystemMessage {
                            message: "alreadyDeleted".into(),
                        })
                    }
                };
                let result = match doc.chunks.split_and_insert(&target, offset, text.clone()) {
                    Ok(r) => r,
                    Err(ChunkStoreError::NotFound(_)) => {
                        return Ok(EditOutcome::NoOp {
                            reply: Envelope::new(
                                "docOpBatch",
                                json!({ "docId": doc_id, "ops": [{ "kind": "alreadyDeleted", "id": target.render() }] }),
                            ),
                        })
                    }
                    Err(e) => return Ok(EditOutcome::SystemMessage { message: e.to_string() }),
                };
                doc.append_op(OpLogEntry::Split {
                    target_id: target.clone(),
                    offset,
                    left_text: doc
                        .chunks
                        .chunks()
                        .iter()
                        .find(|c| Some(&c.id) == result.left_id.as_ref())
                        .map(|c| c.text.clone())
                        .unwrap_or_default(),
                    insert_id: result.insert_id.clone(),
                    insert_text: text.clone(),
                    right_id: result.right_id.clone(),
                    right_text: doc
                        .chunks
                        .chunks()
                        .iter()
                        .find(|c| Some(&c.id) == result.right_id.as_ref())
                        .map(|c| c.text.clone())
                        .unwrap_or_default(),
                    user_id,
                    at: Utc::now(),
                });
                ops_applied.push(json!({
                    "kind": "split",
                    "targetId": target.render(),
                    "insertId": result.insert_id.render(),
                    "text": text,
                }));
            }
            BatchIntent::Primitive(primitive_ops) => {
                let mut resolved: HashMap<String, LseqId> = HashMap::new();
                for op in primitive_ops {
                    match op {
                        PrimitiveOp::Insert {
                            temp_id,
                            left_id,
                            right_id,
                            value,
                        } => {
                            let left = match resolve_ref(&doc, &resolved, left_id.as_ref()) {
                                Ok(v) => v,
                                Err(_) => {
                                    return Ok(EditOutcome::SystemMessage {
                                        message: format!("unresolved placeholder for {temp_id}"),
                                    })
                                }
                            };
                            let right = match resolve_ref(&doc, &resolved, right_id.as_ref()) {
                                Ok(v) => v,
                                Err(_) => {
                                    return Ok(EditOutcome::SystemMessage {
                                        message: format!("unresolved placeholder for {temp_id}"),
                                    })
                                }
                            };
                            let chunk = match doc.chunks.insert_chunk(left.as_ref(), right.as_ref(), value.clone()) {
                                Ok(c) => c,
                                Err(e) => {
                                    return Ok(EditOutcome::SystemMessage { message: e.to_string() })
                                }
                            };
                            resolved.insert(temp_id, chunk.id.clone());
                            doc.append_op(OpLogEntry::Insert {
                                id: chunk.id.clone(),
                                text: value.clone(),
                                left_id: left,
                                right_id: right,
                                user_id,
                                at: Utc::now(),
                            });
                            ops_applied
                                .push(json!({ "kind": "insert", "id": chunk.id.render(), "text": value }));
                        }
                        PrimitiveOp::Delete { id } => {
                            let resolved_id = match resolve_ref(&doc, &resolved, Some(&id)) {
                                Ok(Some(v)) => v,
                                _ => continue,
                            };
                            let text = doc
                                .chunks
                                .chunks()
                                .iter()
                                .find(|c| c.id == resolved_id)
                                .map(|c| c.text.clone());
                            if let DeleteOutcome::Deleted = doc.chunks.delete_chunk(&resolved_id) {
                                doc.append_op(OpLogEntry::Delete {
                                    id: resolved_id.clone(),
                                    text: text.unwrap_or_default(),
                                    user_id,
                                    at: Utc::now(),
                                });
                                ops_applied
                                    .push(json!({ "kind": "delete", "id": resolved_id.render() }));
                            } else {
                                ops_applied.push(
                                    json!({ "kind": "alreadyDeleted", "id": resolved_id.render() }),
                                );
                            }
                        }
                    }
                }
            }
        }

        if ops_applied.is_empty() {
            return Ok(EditOutcome::NoOp {
                reply: Envelope::new("docOpBatch", json!({ "docId": doc_id, "ops": [] })),
            });
        }

        let payload = json!({
            "docId": doc_id,
            "ops": ops_applied,
            "logVersion": doc.version.to_string(),
        });
        self.write_back(doc).await;
        Ok(EditOutcome::Applied {
            reply: Envelope::new("docOpBatch", payload.clone()),
            broadcast_event: "docOpBatch",
            broadcast_payload: payload,
        })
    }

    /// Fan the outcome of a successful edit out to every other viewer of
    /// the document. The originator is excluded here -- it already got the
    /// same ops back as the direct `reply`.
    pub fn broadcast_applied(&self, doc_id: Uuid, event: &str, payload: serde_json::Value, originator: SessionId) {
        self.broadcaster
            .broadcast(doc_id, RoomKind::Doc, event, payload, Some(originator));
    }
}

/// Resolve a `ChunkRef` against the current chunk list (`Id`) or the
/// batch's placeholder map (`Placeholder`). `None` input resolves to
/// `None` (a document boundary).
fn resolve_ref(
    doc: &Document,
    resolved: &HashMap<String, LseqId>,
    reference: Option<&ChunkRef>,
) -> std::result::Result<Option<LseqId>, ()> {
    match reference {
        None => Ok(None),
        Some(ChunkRef::Id(id)) => {
            if doc.chunks.chunks().iter().any(|c| &c.id == id) {
                Ok(Some(id.clone()))
            } else {
                Err(())
            }
        }
        Some(ChunkRef::Placeholder(name)) => resolved.get(name).cloned().map(Some).ok_or(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDocumentCache;

    async fn setup() -> (Dispatcher, SessionRegistry, Uuid, SessionId, Uuid) {
        let registry = SessionRegistry::new();
        let cache = Arc::new(InMemoryDocumentCache::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let dispatcher = Dispatcher::new(registry.clone(), cache.clone(), broadcaster);

        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        registry.register(session_id, user_id);

        let doc = Document::new_leaf(Uuid::new_v4(), "a.txt".into(), None, user_id, 1);
        let doc_id = doc.id;
        cache.put(doc_id, doc).await;
        registry.attach_doc(session_id, doc_id);

        (dispatcher, registry, doc_id, session_id, user_id)
    }

    #[tokio::test]
    async fn bulk_insert_then_delete_round_trips_to_empty_content() {
        let (dispatcher, _registry, doc_id, session_id, _user) = setup().await;

        let outcome = dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::BulkInsert {
                    text: "hello".into(),
                    left_id: None,
                    right_id: None,
                },
            )
            .await
            .unwrap();
        let inserted_id = match outcome {
            EditOutcome::Applied { reply, .. } => {
                reply.data["ops"][0]["id"].as_str().unwrap().to_string()
            }
            _ => panic!("expected Applied"),
        };

        let id = LseqId::parse(&inserted_id).unwrap();
        let outcome = dispatcher
            .edit_doc(session_id, doc_id, EditIntent::Delete { id })
            .await
            .unwrap();
        assert!(matches!(outcome, EditOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn edit_on_a_document_not_being_viewed_is_rejected_as_system_message() {
        let (dispatcher, registry, doc_id, session_id, _user) = setup().await;
        registry.detach_doc(session_id);

        let outcome = dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::BulkInsert {
                    text: "x".into(),
                    left_id: None,
                    right_id: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EditOutcome::SystemMessage { .. }));
    }

    #[tokio::test]
    async fn edit_on_locked_document_is_edit_rejected() {
        let (dispatcher, _registry, doc_id, session_id, _user) = setup().await;
        let mut doc = dispatcher.cache.get(doc_id).await.unwrap();
        doc.status = DocumentStatus::Locked;
        dispatcher.cache.put(doc_id, doc).await;

        let outcome = dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::BulkInsert {
                    text: "x".into(),
                    left_id: None,
                    right_id: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EditOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn split_insert_produces_three_chunks_in_id_order() {
        let (dispatcher, _registry, doc_id, session_id, _user) = setup().await;
        dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::BulkInsert {
                    text: "abcdef".into(),
                    left_id: None,
                    right_id: None,
                },
            )
            .await
            .unwrap();
        let doc = dispatcher.cache.get(doc_id).await.unwrap();
        let target = doc.chunks.chunks()[0].id.clone();

        let outcome = dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::SplitInsert {
                    target_id: ChunkRef::Id(target),
                    offset: 3,
                    text: "Z".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EditOutcome::Applied { .. }));
        let doc = dispatcher.cache.get(doc_id).await.unwrap();
        assert_eq!(doc.content, "abcZdef");
    }

    #[tokio::test]
    async fn primitive_batch_resolves_temp_placeholders() {
        let (dispatcher, _registry, doc_id, session_id, _user) = setup().await;
        let outcome = dispatcher
            .edit_doc_batch(
                session_id,
                doc_id,
                BatchIntent::Primitive(vec![
                    PrimitiveOp::Insert {
                        temp_id: "temp_1".into(),
                        left_id: None,
                        right_id: None,
                        value: "a".into(),
                    },
                    PrimitiveOp::Insert {
                        temp_id: "temp_2".into(),
                        left_id: Some(ChunkRef::Placeholder("temp_1".into())),
                        right_id: None,
                        value: "b".into(),
                    },
                ]),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EditOutcome::Applied { .. }));
        let doc = dispatcher.cache.get(doc_id).await.unwrap();
        assert_eq!(doc.content, "ab");
    }
}
