//! End-to-end collaborative-editing scenarios, driven directly against the
//! dispatcher, lifecycle controller, and broadcaster wired to in-memory
//! fakes -- no live Postgres/Redis required.

use scriptorium::broadcast::{Broadcaster, RoomKind};
use scriptorium::cache::{DocumentCache, InMemoryDocumentCache};
use scriptorium::dispatcher::{BatchIntent, ChunkRef, Dispatcher, EditIntent, EditOutcome};
use scriptorium::document::Document;
use scriptorium::lifecycle::LifecycleController;
use scriptorium::lseq::LseqId;
use scriptorium::registry::SessionRegistry;
use scriptorium::store::{DurableStore, InMemoryDurableStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Harness {
    registry: SessionRegistry,
    cache: Arc<InMemoryDocumentCache>,
    store: Arc<InMemoryDurableStore>,
    broadcaster: Broadcaster,
    dispatcher: Dispatcher,
    lifecycle: LifecycleController,
}

impl Harness {
    fn new() -> Self {
        let registry = SessionRegistry::new();
        let cache = Arc::new(InMemoryDocumentCache::new());
        let store = Arc::new(InMemoryDurableStore::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let dispatcher = Dispatcher::new(registry.clone(), cache.clone(), broadcaster.clone());
        let lifecycle = LifecycleController::new(registry.clone(), cache.clone(), store.clone(), broadcaster.clone());
        Self {
            registry,
            cache,
            store,
            broadcaster,
            dispatcher,
            lifecycle,
        }
    }

    async fn new_viewer(&self, doc_id: Uuid) -> Uuid {
        let session_id = Uuid::new_v4();
        self.registry.register(session_id, Uuid::new_v4());
        self.registry.attach_doc(session_id, doc_id);
        let (tx, _rx) = mpsc::channel(32);
        self.broadcaster.register_sender(session_id, tx);
        session_id
    }

    async fn seed_doc(&self) -> Uuid {
        let owner = Uuid::new_v4();
        let doc = Document::new_leaf(Uuid::new_v4(), "d.txt".into(), None, owner, 1);
        let id = doc.id;
        self.store.create_doc(&doc).await.unwrap();
        self.cache.put(id, doc).await;
        id
    }
}

#[tokio::test]
async fn s1_single_user_insert_then_delete() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let session = h.new_viewer(doc_id).await;

    let outcome = h
        .dispatcher
        .edit_doc_batch(
            session,
            doc_id,
            BatchIntent::BulkInsert {
                text: "hello".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();
    let (inserted_id, log_version) = match outcome {
        EditOutcome::Applied { reply, .. } => (
            reply.data["ops"][0]["id"].as_str().unwrap().to_string(),
            reply.data["logVersion"].as_str().unwrap().to_string(),
        ),
        _ => panic!("expected Applied"),
    };
    assert!(log_version.ends_with(".0.1"));
    assert_eq!(h.cache.get(doc_id).await.unwrap().content, "hello");

    let id = LseqId::parse(&inserted_id).unwrap();
    let outcome = h
        .dispatcher
        .edit_doc(session, doc_id, EditIntent::Delete { id })
        .await
        .unwrap();
    let reply = match outcome {
        EditOutcome::Applied { reply, .. } => reply,
        _ => panic!("expected Applied"),
    };
    assert!(reply.data["logVersion"].as_str().unwrap().ends_with(".0.2"));
    assert_eq!(h.cache.get(doc_id).await.unwrap().content, "");
}

#[tokio::test]
async fn s2_two_user_concurrent_insert_at_same_gap_stays_consistent() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let a = h.new_viewer(doc_id).await;
    let b = h.new_viewer(doc_id).await;

    h.dispatcher
        .edit_doc_batch(
            a,
            doc_id,
            BatchIntent::BulkInsert {
                text: "hello".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();
    let i1 = h.cache.get(doc_id).await.unwrap().chunks.chunks()[0].id.clone();

    let outcome_a = h
        .dispatcher
        .edit_doc_batch(
            a,
            doc_id,
            BatchIntent::BulkInsert {
                text: "X".into(),
                left_id: Some(ChunkRef::Id(i1.clone())),
                right_id: None,
            },
        )
        .await
        .unwrap();
    let outcome_b = h
        .dispatcher
        .edit_doc_batch(
            b,
            doc_id,
            BatchIntent::BulkInsert {
                text: "X".into(),
                left_id: Some(ChunkRef::Id(i1.clone())),
                right_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome_a, EditOutcome::Applied { .. }));
    assert!(matches!(outcome_b, EditOutcome::Applied { .. }));

    let doc = h.cache.get(doc_id).await.unwrap();
    assert_eq!(doc.content.len(), 7);
    let ids: Vec<_> = doc.chunks.chunks().iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids[0], i1);
    assert_ne!(ids[1], ids[2]);
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "chunk list must already be in id order");
}

#[tokio::test]
async fn s3_in_chunk_split_insert_produces_three_ordered_chunks() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let session = h.new_viewer(doc_id).await;

    h.dispatcher
        .edit_doc_batch(
            session,
            doc_id,
            BatchIntent::BulkInsert {
                text: "abcdef".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();
    let target = h.cache.get(doc_id).await.unwrap().chunks.chunks()[0].id.clone();

    let outcome = h
        .dispatcher
        .edit_doc_batch(
            session,
            doc_id,
            BatchIntent::SplitInsert {
                target_id: ChunkRef::Id(target.clone()),
                offset: 3,
                text: "Z".into(),
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, EditOutcome::Applied { .. }));

    let doc = h.cache.get(doc_id).await.unwrap();
    assert_eq!(doc.content, "abcZdef");
    let chunks = doc.chunks.chunks();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].text, "abc");
    assert_eq!(chunks[1].text, "Z");
    assert_eq!(chunks[2].text, "def");
    assert!(chunks[0].id < chunks[1].id);
    assert!(chunks[1].id < chunks[2].id);
}

#[tokio::test]
async fn s4_viewer_departure_triggers_write_through_only_on_last_leave() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let first = h.new_viewer(doc_id).await;
    let second = h.new_viewer(doc_id).await;

    h.dispatcher
        .edit_doc_batch(
            first,
            doc_id,
            BatchIntent::BulkInsert {
                text: "hi".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();

    h.registry.detach_doc(first);
    h.lifecycle.on_last_viewer_leave(doc_id).await;
    assert!(
        h.store.load_doc(doc_id).await.unwrap().unwrap().content.is_empty(),
        "no write-through while a viewer remains"
    );

    h.registry.detach_doc(second);
    h.lifecycle.on_last_viewer_leave(doc_id).await;
    let stored = h.store.load_doc(doc_id).await.unwrap().unwrap();
    assert_eq!(stored.content, "hi");
    assert_eq!(stored.version, h.cache.get(doc_id).await.unwrap().version);
}

#[tokio::test]
async fn s5_snapshot_clears_log_and_notifies_every_viewer_once() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let v1 = h.new_viewer(doc_id).await;
    let v2 = h.new_viewer(doc_id).await;

    for _ in 0..17 {
        h.dispatcher
            .edit_doc_batch(
                v1,
                doc_id,
                BatchIntent::BulkInsert {
                    text: "x".into(),
                    left_id: None,
                    right_id: None,
                },
            )
            .await
            .unwrap();
    }
    let before = h.cache.get(doc_id).await.unwrap();
    assert_eq!(before.version.log, 17);

    let (tx1, mut rx1) = mpsc::channel(32);
    let (tx2, mut rx2) = mpsc::channel(32);
    h.broadcaster.register_sender(v1, tx1);
    h.broadcaster.register_sender(v2, tx2);

    let result = h.lifecycle.snapshot(doc_id).await.unwrap();
    assert_eq!(result.version.snapshot, before.version.snapshot + 1);
    assert_eq!(result.version.log, 0);
    assert!(result.op_log.is_empty());

    let stored = h.store.load_doc(doc_id).await.unwrap().unwrap();
    assert!(stored.op_log.is_empty());
    assert_eq!(stored.chunks.chunks(), result.chunks.chunks());

    let mut seen_v1 = 0;
    while let Ok(envelope) = rx1.try_recv() {
        if envelope.event == "docSnapshotCreated" {
            seen_v1 += 1;
        }
    }
    let mut seen_v2 = 0;
    while let Ok(envelope) = rx2.try_recv() {
        if envelope.event == "docSnapshotCreated" {
            seen_v2 += 1;
        }
    }
    assert_eq!(seen_v1, 1);
    assert_eq!(seen_v2, 1);
}

#[tokio::test]
async fn s6_edit_during_lock_is_rejected_then_succeeds_after_unlock() {
    let h = Harness::new();
    let doc_id = h.seed_doc().await;
    let viewer = h.new_viewer(doc_id).await;

    h.lifecycle.lock_doc(doc_id, "sync in progress").await.unwrap();
    let op_log_len_before = h.cache.get(doc_id).await.unwrap().op_log.len();

    let outcome = h
        .dispatcher
        .edit_doc_batch(
            viewer,
            doc_id,
            BatchIntent::BulkInsert {
                text: "late".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, EditOutcome::Rejected { reason } if !reason.is_empty()));
    assert_eq!(h.cache.get(doc_id).await.unwrap().op_log.len(), op_log_len_before);

    h.lifecycle.unlock_doc(doc_id).await.unwrap();

    let outcome = h
        .dispatcher
        .edit_doc_batch(
            viewer,
            doc_id,
            BatchIntent::BulkInsert {
                text: "late".into(),
                left_id: None,
                right_id: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, EditOutcome::Applied { .. }));
    assert_eq!(h.cache.get(doc_id).await.unwrap().content, "late");
}
