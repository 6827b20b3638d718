//! Implements [`SequenceIdAllocator`].

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use tracing::{trace, warn};

use crate::SequenceId;

struct AllocatorState {
    next: SequenceId,
    free: BTreeSet<SequenceId>,
}

/// Hands out sequence ids that are unique among live sessions.
///
/// Released ids go back into a pool; the lowest pooled id is reused before the counter
/// advances, which keeps ids (and therefore `n_seq_max`) small.
pub struct SequenceIdAllocator {
    state: Mutex<AllocatorState>,
}

impl SequenceIdAllocator {
    /// Creates an allocator whose first id is 0.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: 0,
                free: BTreeSet::new(),
            }),
        }
    }

    /// Returns an id no other live holder has.
    pub fn allocate(&self) -> SequenceId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let id = match state.free.pop_first() {
            Some(id) => id,
            None => {
                let id = state.next;
                state.next += 1;
                id
            }
        };

        trace!(id, "Allocated sequence id");
        id
    }

    /// Makes `id` available again.
    pub fn release(&self, id: SequenceId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if id < 0 || id >= state.next || !state.free.insert(id) {
            warn!(id, "Ignoring release of a sequence id that is not allocated");
            return;
        }

        trace!(id, "Released sequence id");
    }

    /// Returns the number of ids currently handed out.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next as usize - state.free.len()
    }
}

impl Default for SequenceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
