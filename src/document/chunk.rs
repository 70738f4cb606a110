//! In-memory ordered chunk sequence for an open document (C2).
//!
//! A document's text is a strictly id-ordered sequence of non-empty chunks;
//! concatenating their text in id order yields the rendered content
//! (invariant 1/2). All four operations here are pure data-structure
//! manipulations -- they never touch the cache or durable store themselves,
//! so the dispatcher can serialize them per document without any I/O inside
//! the critical section.

use crate::lseq::{between, LseqId};
use serde::{Deserialize, Serialize};

/// A maximal contiguous run of characters sharing one LSEQ id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: LseqId,
    pub text: String,
}

/// Outcome of a `delete_chunk` call, distinguishing a real removal from a
/// no-op against an id that is already gone (invariant 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
}

/// Outcome of a `split_and_insert` call: the ids of the (up to three)
/// resulting chunks, so the dispatcher can build the op-log entry.
#[derive(Debug, Clone)]
pub struct SplitResult {
    /// Id of the left remnant, if any text remained before the split point.
    /// Always equal to the target id when present (the original id is
    /// reused for the left remnant).
    pub left_id: Option<LseqId>,
    pub insert_id: LseqId,
    /// Id of the right remnant, if any text remained after the split point.
    pub right_id: Option<LseqId>,
}

/// Error returned by chunk-store operations that reference an id that must
/// exist in the current sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("chunk id not found: {0}")]
    NotFound(String),
    #[error("duplicate chunk id: {0}")]
    Duplicate(String),
    #[error("offset {offset} out of bounds for chunk of length {len}")]
    OffsetOutOfBounds { offset: usize, len: usize },
    #[error("chunk text must be non-empty")]
    EmptyText,
}

type Result<T> = std::result::Result<T, ChunkStoreError>;

/// Translate a character offset into the byte offset `text` must be sliced
/// at. Offsets throughout this module (and the wire protocol) count
/// characters, not bytes, so multibyte chunk text never panics on a
/// non-boundary byte index.
fn char_boundary(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}

/// The ordered chunk sequence for a single open document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Build a store from chunks already known to be id-sorted and
    /// non-duplicated (snapshot load, replay output).
    pub fn from_sorted(chunks: Vec<Chunk>) -> Self {
        debug_assert!(
            chunks.windows(2).all(|w| w[0].id < w[1].id),
            "chunks passed to from_sorted must be strictly id-ordered"
        );
        Self { chunks }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The document's rendered content: concatenation of chunk texts in id
    /// order (invariant 2).
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.chunks.iter().map(|c| c.text.len()).sum());
        for c in &self.chunks {
            out.push_str(&c.text);
        }
        out
    }

    fn position_of(&self, id: &LseqId) -> std::result::Result<usize, usize> {
        self.chunks.binary_search_by(|c| c.id.cmp(id))
    }

    fn get(&self, id: &LseqId) -> Option<&Chunk> {
        self.position_of(id).ok().map(|i| &self.chunks[i])
    }

    fn neighbor_id_of(&self, id: &LseqId) -> Option<LseqId> {
        self.get(id).map(|c| c.id.clone())
    }

    /// Id of the chunk immediately following the one at `index`, if any.
    fn next_id_after(&self, index: usize) -> Option<LseqId> {
        self.chunks.get(index + 1).map(|c| c.id.clone())
    }

    /// `insertChunk(leftId?, rightId?, text)` -- allocate a fresh id between
    /// the given neighbors and insert. The caller is expected to pass the
    /// actual neighboring ids already present in the store (or `None` for a
    /// document boundary); this function does not validate that `left_id`/
    /// `right_id` are themselves present, since replay also calls the
    /// lower-level `insert_with_id` directly with server-allocated ids.
    pub fn insert_chunk(
        &mut self,
        left_id: Option<&LseqId>,
        right_id: Option<&LseqId>,
        text: String,
    ) -> Result<Chunk> {
        if text.is_empty() {
            return Err(ChunkStoreError::EmptyText);
        }
        let id = between(left_id, right_id);
        self.insert_with_id(id.clone(), text.clone())?;
        Ok(Chunk { id, text })
    }

    /// Insert a chunk at a server- or replay-determined id. Used by
    /// `insert_chunk` and directly by op-log replay, which already knows
    /// the id to use rather than allocating a fresh one.
    pub fn insert_with_id(&mut self, id: LseqId, text: String) -> Result<()> {
        if text.is_empty() {
            return Err(ChunkStoreError::EmptyText);
        }
        match self.position_of(&id) {
            Ok(_) => Err(ChunkStoreError::Duplicate(id.render())),
            Err(insert_at) => {
                self.chunks.insert(insert_at, Chunk { id, text });
                Ok(())
            }
        }
    }

    /// `splitAndInsert(targetId, offset, text)`.
    pub fn split_and_insert(
        &mut self,
        target_id: &LseqId,
        offset: usize,
        text: String,
    ) -> Result<SplitResult> {
        if text.is_empty() {
            return Err(ChunkStoreError::EmptyText);
        }
        let target_index = self
            .position_of(target_id)
            .map_err(|_| ChunkStoreError::NotFound(target_id.render()))?;
        let target_len = self.chunks[target_index].text.chars().count();
        if offset > target_len {
            return Err(ChunkStoreError::OffsetOutOfBounds {
                offset,
                len: target_len,
            });
        }

        let next_id = self.next_id_after(target_index);
        let (left_text, right_text) = {
            let target_text = &self.chunks[target_index].text;
            let byte_offset = char_boundary(target_text, offset);
            (target_text[..byte_offset].to_string(), target_text[byte_offset..].to_string())
        };

        let insert_id = between(Some(target_id), next_id.as_ref());
        let right_id = if right_text.is_empty() {
            None
        } else {
            Some(between(Some(&insert_id), next_id.as_ref()))
        };

        self.finish_split(
            target_index,
            target_id,
            left_text,
            insert_id.clone(),
            text,
            right_id.clone(),
            right_text,
        );

        let left_id = if self.neighbor_id_of(target_id).is_some() {
            Some(target_id.clone())
        } else {
            None
        };

        Ok(SplitResult {
            left_id,
            insert_id,
            right_id,
        })
    }

    /// Apply a split using ids already decided (by `split_and_insert` above,
    /// or by replay, which reuses the ids recorded in the op log entry).
    #[allow(clippy::too_many_arguments)]
    pub fn apply_split(
        &mut self,
        target_id: &LseqId,
        offset: usize,
        left_text: String,
        insert_id: LseqId,
        insert_text: String,
        right_id: Option<LseqId>,
        right_text: String,
    ) -> Result<()> {
        let target_index = match self.position_of(target_id) {
            Ok(i) => i,
            // Replay is total: a split referencing an already-gone target
            // is a no-op rather than an error.
            Err(_) => return Ok(()),
        };
        let target_len = self.chunks[target_index].text.chars().count();
        if offset > target_len {
            return Err(ChunkStoreError::OffsetOutOfBounds {
                offset,
                len: target_len,
            });
        }
        self.finish_split(
            target_index,
            target_id,
            left_text,
            insert_id,
            insert_text,
            right_id,
            right_text,
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_split(
        &mut self,
        target_index: usize,
        target_id: &LseqId,
        left_text: String,
        insert_id: LseqId,
        insert_text: String,
        right_id: Option<LseqId>,
        right_text: String,
    ) {
        // Build the replacement run in id order: left remnant (reusing the
        // original id), the new middle chunk, then the right remnant.
        let mut replacement = Vec::with_capacity(3);
        if !left_text.is_empty() {
            replacement.push(Chunk {
                id: target_id.clone(),
                text: left_text,
            });
        }
        replacement.push(Chunk {
            id: insert_id,
            text: insert_text,
        });
        if !right_text.is_empty() {
            if let Some(right_id) = right_id {
                replacement.push(Chunk {
                    id: right_id,
                    text: right_text,
                });
            }
        }
        self.chunks.splice(target_index..=target_index, replacement);
    }

    /// `deleteChunk(id)` -- idempotent removal.
    pub fn delete_chunk(&mut self, id: &LseqId) -> DeleteOutcome {
        match self.position_of(id) {
            Ok(index) => {
                self.chunks.remove(index);
                DeleteOutcome::Deleted
            }
            Err(_) => DeleteOutcome::AlreadyDeleted,
        }
    }

    /// `trim(id, startOffset, endOffset)` -- remove `text[start..end]` from
    /// the chunk, dropping the chunk entirely if it becomes empty. Returns
    /// the removed text and the chunk's remaining text, or `None` if `id`
    /// is already gone (replay total-ness).
    pub fn trim(
        &mut self,
        id: &LseqId,
        start_offset: usize,
        end_offset: usize,
    ) -> Result<Option<(String, String)>> {
        let index = match self.position_of(id) {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let len = self.chunks[index].text.chars().count();
        if start_offset > end_offset || end_offset > len {
            return Err(ChunkStoreError::OffsetOutOfBounds {
                offset: end_offset,
                len,
            });
        }
        let text = &self.chunks[index].text;
        let start_byte = char_boundary(text, start_offset);
        let end_byte = char_boundary(text, end_offset);
        let deleted_text = text[start_byte..end_byte].to_string();
        let mut new_text = String::with_capacity(text.len() - deleted_text.len());
        new_text.push_str(&text[..start_byte]);
        new_text.push_str(&text[end_byte..]);

        if new_text.is_empty() {
            self.chunks.remove(index);
        } else {
            self.chunks[index].text = new_text.clone();
        }
        Ok(Some((deleted_text, new_text)))
    }
}
