//! Per-core retry queue for parents stopped by resource exhaustion.
//!
//! Strict FIFO: only the head is ever retried, so a request that queued first
//! cannot be starved by later arrivals. The queue itself is passive; the
//! registry's per-core poller drives the draining.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::request::ParentIo;
use crate::volume::PooledVolume;

#[derive(Default)]
pub(crate) struct WaitQueue {
    queue: VecDeque<Arc<ParentIo>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, parent: Arc<ParentIo>) {
        self.queue.push_back(parent);
    }

    pub fn peek_head(&self) -> Option<Arc<ParentIo>> {
        self.queue.front().cloned()
    }

    /// Remove the head. The caller must have resumed exactly this parent.
    pub fn pop_head(&mut self, expected: &Arc<ParentIo>) {
        let head = self.queue.pop_front().expect("pop from empty wait queue");
        assert!(Arc::ptr_eq(&head, expected), "wait queue head changed under drain");
    }

    /// Remove and return every queued parent belonging to `volume`.
    pub fn remove_for_volume(&mut self, volume: &Arc<PooledVolume>) -> Vec<Arc<ParentIo>> {
        let mut removed = Vec::new();
        self.queue.retain(|parent| {
            let matches = parent
                .channel()
                .is_some_and(|channel| Arc::ptr_eq(channel.volume(), volume));
            if matches {
                removed.push(Arc::clone(parent));
            }
            !matches
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
