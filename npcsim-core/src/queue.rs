//! Processing queue: NPCs whose short-term memory is due for compression.
//!
//! First-in first-out, and an NPC is queued at most once. Recording an event
//! only ever touches this queue, never the processing itself, so callers are
//! not blocked behind a running batch.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::NpcId;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Newly queued.
    Queued,
    /// Already waiting; nothing changed.
    AlreadyQueued,
    /// Queue full; try again on the next event.
    Dropped,
}

/// Thread-safe deduplicating FIFO of NPC ids. Clones share the same queue.
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<Mutex<QueueInner>>,
}

struct QueueInner {
    order: VecDeque<NpcId>,
    pending: HashSet<NpcId>,
    max_queue_size: usize,
    total_enqueued: u64,
    total_dropped: u64,
    total_drained: u64,
    total_requeued: u64,
}

/// Statistics about the processing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Current queue depth.
    pub depth: usize,
    /// Total NPCs enqueued.
    pub total_enqueued: u64,
    /// Total enqueue attempts dropped (queue full).
    pub total_dropped: u64,
    /// Total NPCs handed to processing.
    pub total_drained: u64,
    /// Total NPCs put back after a cancelled batch.
    pub total_requeued: u64,
}

impl ProcessingQueue {
    /// Create a queue holding at most `max_queue_size` NPCs.
    #[must_use]
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                order: VecDeque::new(),
                pending: HashSet::new(),
                max_queue_size,
                total_enqueued: 0,
                total_dropped: 0,
                total_drained: 0,
                total_requeued: 0,
            })),
        }
    }

    /// Queue `npc` for processing.
    pub fn enqueue(&self, npc: NpcId) -> Enqueued {
        let mut inner = self.inner.lock();
        if inner.pending.contains(&npc) {
            return Enqueued::AlreadyQueued;
        }
        if inner.order.len() >= inner.max_queue_size {
            inner.total_dropped += 1;
            return Enqueued::Dropped;
        }
        inner.pending.insert(npc);
        inner.order.push_back(npc);
        inner.total_enqueued += 1;
        Enqueued::Queued
    }

    /// Remove and return up to `max` NPCs, oldest first.
    pub fn drain(&self, max: usize) -> Vec<NpcId> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.order.len());
        let batch: Vec<NpcId> = inner.order.drain(..take).collect();
        for npc in &batch {
            inner.pending.remove(npc);
        }
        inner.total_drained += batch.len() as u64;
        batch
    }

    /// Put NPCs from an unfinished batch back at the front, in their original
    /// order. NPCs queued again in the meantime are not duplicated. Ignores
    /// the size cap so no drained NPC is lost.
    pub fn requeue_front(&self, npcs: &[NpcId]) {
        let mut inner = self.inner.lock();
        for npc in npcs.iter().rev() {
            if inner.pending.insert(*npc) {
                inner.order.push_front(*npc);
                inner.total_requeued += 1;
            }
        }
    }

    /// Whether `npc` is waiting.
    #[must_use]
    pub fn contains(&self, npc: NpcId) -> bool {
        self.inner.lock().pending.contains(&npc)
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Get queue statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.order.len(),
            total_enqueued: inner.total_enqueued,
            total_dropped: inner.total_dropped,
            total_drained: inner.total_drained,
            total_requeued: inner.total_requeued,
        }
    }
}

impl std::fmt::Debug for ProcessingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingQueue").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_without_duplicates() {
        let queue = ProcessingQueue::new(100);
        let (a, b) = (NpcId::new(), NpcId::new());
        assert_eq!(queue.enqueue(a), Enqueued::Queued);
        assert_eq!(queue.enqueue(b), Enqueued::Queued);
        assert_eq!(queue.enqueue(a), Enqueued::AlreadyQueued);
        assert_eq!(queue.drain(10), vec![a, b]);
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(a), Enqueued::Queued, "drained NPCs can queue again");
    }

    #[test]
    fn queue_full_drops_request() {
        let queue = ProcessingQueue::new(1);
        assert_eq!(queue.enqueue(NpcId::new()), Enqueued::Queued);
        assert_eq!(queue.enqueue(NpcId::new()), Enqueued::Dropped);
        assert_eq!(queue.stats().total_dropped, 1);
    }

    #[test]
    fn drain_respects_batch_size() {
        let queue = ProcessingQueue::new(100);
        let ids: Vec<NpcId> = (0..5).map(|_| NpcId::new()).collect();
        for id in &ids {
            queue.enqueue(*id);
        }
        assert_eq!(queue.drain(2), ids[..2].to_vec());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn requeue_restores_front_in_order() {
        let queue = ProcessingQueue::new(100);
        let (a, b, c) = (NpcId::new(), NpcId::new(), NpcId::new());
        queue.enqueue(a);
        queue.enqueue(b);
        let batch = queue.drain(2);
        queue.enqueue(c);
        queue.enqueue(b);
        queue.requeue_front(&batch);
        assert_eq!(queue.drain(10), vec![a, c, b]);
        assert_eq!(queue.stats().total_requeued, 1);
    }

    #[test]
    fn clones_share_state() {
        let queue = ProcessingQueue::new(10);
        let other = queue.clone();
        let a = NpcId::new();
        other.enqueue(a);
        assert!(queue.contains(a));
    }
}
