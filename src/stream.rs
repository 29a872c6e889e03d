//! Reordering of transport deltas into caller-visible stream chunks.
//!
//! Transports tag each [`ProviderDelta`] with an index. [`ChunkSequencer`]
//! buffers deltas that arrive ahead of the next expected index and releases
//! them as soon as the gap closes, assigning its own contiguous `sequence`
//! numbers to the emitted [`StreamChunk`]s.
//!
//! ```text
//! delta idx:   0   2   3   1        4
//! released:    0  (buf)(buf) 1,2,3  4
//! sequence:    0             1,2,3  4
//! ```
//!
//! Deltas whose index was already released are duplicates and are dropped.
//! When the transport ends with gaps, [`ChunkSequencer::finish`] flushes the
//! remaining buffered deltas in ascending index order.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::traits::{ProviderDelta, StreamChunk, TokenUsage};

/// Per-request reorder buffer.
#[derive(Debug)]
pub struct ChunkSequencer {
    request_id: Uuid,
    next_index: u64,
    next_sequence: u64,
    pending: BTreeMap<u64, String>,
    text: String,
    usage: Option<TokenUsage>,
}

impl ChunkSequencer {
    /// Create a sequencer for one request.
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            next_index: 0,
            next_sequence: 0,
            pending: BTreeMap::new(),
            text: String::new(),
            usage: None,
        }
    }

    /// Accept one delta and return the chunks that became deliverable.
    pub fn push(&mut self, delta: ProviderDelta) -> Vec<StreamChunk> {
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }

        if delta.index < self.next_index || self.pending.contains_key(&delta.index) {
            tracing::debug!(index = delta.index, "Dropping duplicate stream delta");
            return Vec::new();
        }
        self.pending.insert(delta.index, delta.text);

        let mut ready = Vec::new();
        while let Some(text) = self.pending.remove(&self.next_index) {
            self.next_index += 1;
            if let Some(chunk) = self.emit(text) {
                ready.push(chunk);
            }
        }
        ready
    }

    /// Flush buffered deltas left behind by gaps, in index order.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::warn!(
                buffered = pending.len(),
                expected_index = self.next_index,
                "Stream ended with missing deltas, flushing buffered text"
            );
        }
        let mut ready = Vec::new();
        for (index, text) in pending {
            self.next_index = index + 1;
            if let Some(chunk) = self.emit(text) {
                ready.push(chunk);
            }
        }
        ready
    }

    /// The terminal chunk: empty text, `is_final = true`.
    pub fn final_chunk(&mut self) -> StreamChunk {
        let chunk = StreamChunk {
            request_id: self.request_id,
            sequence: self.next_sequence,
            text: String::new(),
            is_final: true,
        };
        self.next_sequence += 1;
        chunk
    }

    /// Whether any chunk has been produced.
    pub fn has_emitted(&self) -> bool {
        self.next_sequence > 0
    }

    /// Text assembled from released chunks so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Last usage reported by the transport.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Consume into assembled text and usage.
    pub fn into_parts(self) -> (String, Option<TokenUsage>) {
        (self.text, self.usage)
    }

    fn emit(&mut self, text: String) -> Option<StreamChunk> {
        // Empty deltas (role headers, keep-alives) still advance the index.
        if text.is_empty() {
            return None;
        }
        self.text.push_str(&text);
        let chunk = StreamChunk {
            request_id: self.request_id,
            sequence: self.next_sequence,
            text,
            is_final: false,
        };
        self.next_sequence += 1;
        Some(chunk)
    }
}
