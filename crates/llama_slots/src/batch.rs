//! Implements the [`Batch`] struct

use tinyvec::TinyVec;
use tracing::trace;

use crate::{SequenceId, Token};

/// A single entry of a [`Batch`].
#[derive(Clone, Debug, PartialEq)]
pub struct BatchEntry {
    /// The token to decode.
    pub token: Token,

    /// The position of the token within its sequence.
    pub position: usize,

    /// The sequences this token belongs to.
    pub sequence_ids: TinyVec<[SequenceId; 2]>,

    /// Whether the backend should produce logits for this entry.
    pub logits: bool,
}

/// A fixed-capacity list of tokens to be decoded in a single backend call.
///
/// Sessions keep one of these alive for as long as their context lives and reset it before
/// every decode, so ingestion never reallocates.
#[derive(Debug)]
pub struct Batch {
    entries: Vec<BatchEntry>,

    /// The maximum number of tokens this batch can have.
    capacity: usize,

    /// The maximum number of sequences a single token can be tagged with.
    max_sequences: usize,
}

impl Batch {
    /// Creates an empty batch.
    ///
    /// # Panics
    ///
    /// If `capacity` or `max_sequences` is zero. This struct is only constructed inside this
    /// crate with configuration that has already been validated.
    pub fn new(capacity: usize, max_sequences: usize) -> Self {
        if capacity == 0 {
            panic!("Cannot create a batch with no capacity");
        }
        if max_sequences == 0 {
            panic!("At least one sequence must be generated");
        }

        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            max_sequences,
        }
    }

    /// Empties the batch without releasing its storage.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Appends a token, returning its index, or `None` if the batch is full or too many
    /// sequence ids were provided.
    pub fn add(
        &mut self,
        token: Token,
        position: usize,
        sequence_ids: &[SequenceId],
        logits: bool,
    ) -> Option<usize> {
        trace!(
            "Writing token {} of {} ({token:?})",
            self.entries.len(),
            self.capacity
        );

        if self.entries.len() == self.capacity || self.max_sequences < sequence_ids.len() {
            return None;
        }

        self.entries.push(BatchEntry {
            token,
            position,
            sequence_ids: sequence_ids.iter().copied().collect(),
            logits,
        });

        Some(self.entries.len() - 1)
    }

    /// Sets whether the entry at `idx` produces logits.
    ///
    /// # Panics
    ///
    /// If `idx` is out of bounds.
    pub fn set_logits(&mut self, idx: usize, value: bool) {
        assert!(idx < self.entries.len(), "Index out of bounds");
        self.entries[idx].logits = value;
    }

    /// Returns the number of tokens in the batch.
    pub fn tokens(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the maximum number of tokens this batch can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the entries in insertion order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Returns the index of the last entry that requested logits.
    pub fn last_logits_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|entry| entry.logits)
    }
}
