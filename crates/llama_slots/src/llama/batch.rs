//! Converts a [`Batch`] into a native [`llama_batch`].

use llama_cpp_sys::{llama_batch, llama_batch_free, llama_batch_init};
use tracing::trace;

use crate::batch::Batch;

/// A natively allocated batch, reused across decodes of one context.
pub(crate) struct NativeBatch {
    inner: llama_batch,

    /// The maximum number of tokens this batch can have.
    capacity: usize,

    /// The maximum number of sequences a single token can be tagged with.
    max_sequences: usize,
}

unsafe impl Send for NativeBatch {}

impl NativeBatch {
    pub(crate) fn new(capacity: usize, max_sequences: usize) -> Self {
        let capacity = capacity.max(1);
        let max_sequences = max_sequences.max(1);

        Self {
            inner: unsafe { llama_batch_init(capacity as i32, 0, max_sequences as i32) },
            capacity,
            max_sequences,
        }
    }

    /// Whether `batch` fits in this allocation.
    pub(crate) fn fits(&self, batch: &Batch) -> bool {
        batch.tokens() <= self.capacity
            && batch
                .entries()
                .iter()
                .all(|entry| entry.sequence_ids.len() <= self.max_sequences)
    }

    /// Copies `batch` into the native buffers. The caller checks [`NativeBatch::fits`] first.
    pub(crate) fn fill(&mut self, batch: &Batch) {
        self.inner.n_tokens = 0;

        for (i, entry) in batch.entries().iter().enumerate() {
            trace!("Writing token {i} of {} ({:?})", self.capacity, entry.token);

            unsafe {
                // SAFETY: `i < capacity` and every sequence list fits, as checked by `fits`;
                // `llama_batch_init` allocated each of these offsets.
                self.inner.token.add(i).write(entry.token.0);
                self.inner.pos.add(i).write(entry.position as i32);
                self.inner.logits.add(i).write(i8::from(entry.logits));
                self.inner
                    .n_seq_id
                    .add(i)
                    .write(entry.sequence_ids.len() as i32);

                let seq_ptr = *self.inner.seq_id.add(i);
                if !seq_ptr.is_null() {
                    for (j, id) in entry.sequence_ids.iter().enumerate() {
                        seq_ptr.add(j).write(*id);
                    }
                }
            }

            self.inner.n_tokens += 1;
        }
    }

    pub(crate) fn handle(&self) -> llama_batch {
        self.inner
    }
}

impl Drop for NativeBatch {
    fn drop(&mut self) {
        trace!("Freeing batch");

        unsafe { llama_batch_free(self.inner) }
    }
}
