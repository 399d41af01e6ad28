//! Bounded in-memory event queue shared by producers and the flush timer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracehound_core::TraceEvent;
use tracing::warn;

/// FIFO queue with oldest-first eviction once `capacity` is reached.
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TraceEvent>> {
        // A panic mid-push leaves the deque itself intact.
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: TraceEvent) {
        let mut events = self.lock();
        events.push_back(event);
        let evicted = self.evict_overflow(&mut events);
        drop(events);
        self.record_drops(evicted);
    }

    /// Removes up to `max` events from the front, in order.
    pub fn drain_batch(&self, max: usize) -> Vec<TraceEvent> {
        let mut events = self.lock();
        let n = max.min(events.len());
        events.drain(..n).collect()
    }

    /// Puts an unsent batch back at the front so it goes out before newer events.
    pub fn requeue_front(&self, batch: Vec<TraceEvent>) {
        let mut events = self.lock();
        for event in batch.into_iter().rev() {
            events.push_front(event);
        }
        let evicted = self.evict_overflow(&mut events);
        drop(events);
        self.record_drops(evicted);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn evict_overflow(&self, events: &mut VecDeque<TraceEvent>) -> u64 {
        let mut evicted = 0;
        while events.len() > self.capacity {
            events.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn record_drops(&self, evicted: u64) {
        if evicted == 0 {
            return;
        }
        let total = self.dropped.fetch_add(evicted, Ordering::Relaxed) + evicted;
        warn!(evicted, total, capacity = self.capacity, "Trace queue full; dropped oldest events");
    }
}
