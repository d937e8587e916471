// Deferred cleanup
//
// GPU resources that may still be referenced by an in-flight frame are not
// destroyed immediately. Their destruction is queued against a frame slot
// and run the next time that slot is about to be reused, after its fence
// has signaled.

/// Zero-argument destruction action
pub type CleanupAction = Box<dyn FnOnce()>;

pub struct DeferredCleanup {
    pending: Vec<Vec<CleanupAction>>,
}

impl DeferredCleanup {
    pub fn new(slots: usize) -> Self {
        Self {
            pending: (0..slots).map(|_| Vec::new()).collect(),
        }
    }

    pub fn slots(&self) -> usize {
        self.pending.len()
    }

    /// Queue `action` to run when `slot` is next reused
    pub fn schedule(&mut self, slot: usize, action: CleanupAction) {
        let index = slot % self.pending.len();
        self.pending[index].push(action);
    }

    pub fn pending(&self, slot: usize) -> usize {
        self.pending.get(slot).map_or(0, Vec::len)
    }

    /// Run and clear every action queued against `slot`, in registration order
    pub fn drain(&mut self, slot: usize) -> usize {
        let Some(actions) = self.pending.get_mut(slot) else {
            return 0;
        };
        let actions = std::mem::take(actions);
        let count = actions.len();
        for action in actions {
            action();
        }
        if count > 0 {
            log::debug!("Ran {} deferred cleanup action(s) for frame slot {}", count, slot);
        }
        count
    }

    /// Run everything still queued; only valid once the device is idle
    pub fn drain_all(&mut self) -> usize {
        (0..self.pending.len()).map(|slot| self.drain(slot)).sum()
    }
}
