//! The document aggregate: chunk list, op log, version, and metadata.

pub mod chunk;
pub mod oplog;
pub mod version;

pub use chunk::{Chunk, ChunkStore, ChunkStoreError, DeleteOutcome, SplitResult};
pub use oplog::{replay, OpLogEntry};
pub use version::Version;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime status of a document. `LOCKED` and `DELETED` additionally gate
/// the edit dispatcher (invariants 5 and 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Normal,
    Deleted,
    Locked,
}

impl DocumentStatus {
    /// Maps to the `0/1/2` integer encoding used in the durable store.
    /// `Locked` is only ever held in the cache; callers should not persist
    /// it to the durable store.
    pub fn as_i16(self) -> i16 {
        match self {
            DocumentStatus::Normal => 0,
            DocumentStatus::Deleted => 1,
            DocumentStatus::Locked => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(DocumentStatus::Normal),
            1 => Some(DocumentStatus::Deleted),
            2 => Some(DocumentStatus::Locked),
            _ => None,
        }
    }
}

/// A document: a leaf (file) or directory entry within a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_directory: bool,
    pub status: DocumentStatus,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
    /// Derived: kept in sync with `chunks` for consumers that do not
    /// replay the chunk list themselves.
    pub content: String,
    pub chunks: ChunkStore,
    pub op_log: Vec<OpLogEntry>,
}

impl Document {
    /// Construct a freshly created, empty leaf document.
    pub fn new_leaf(
        channel_id: Uuid,
        name: String,
        parent_id: Option<Uuid>,
        created_by: Uuid,
        service_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel_id,
            name,
            parent_id,
            is_directory: false,
            status: DocumentStatus::Normal,
            created_by,
            created_at: now,
            updated_at: now,
            version: Version::initial(service_version),
            content: String::new(),
            chunks: ChunkStore::new(),
            op_log: Vec::new(),
        }
    }

    /// Re-derive `content` from the current chunk list (invariant 2).
    pub fn refresh_content(&mut self) {
        self.content = self.chunks.render();
    }

    pub fn append_op(&mut self, entry: OpLogEntry) {
        self.op_log.push(entry);
        self.version = self.version.bump_log();
        self.refresh_content();
        self.updated_at = Utc::now();
    }

    /// Clear the op log and bump the snapshot component (C10 `snapshot`).
    pub fn snapshot_bump(&mut self) {
        self.op_log.clear();
        self.version = self.version.bump_snapshot();
    }
}
