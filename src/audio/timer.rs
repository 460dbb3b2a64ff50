// src/audio/timer.rs
// Cancellable deadlines driven by the bookkeeping clock

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

/// What a deadline does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    StopPlayback { card: usize, stream: usize },
    StopRecord { card: usize, port: usize },
    FadeTick { card: usize, stream: usize },
}

/// Min-heap of deadlines with at most one pending entry per key.
///
/// Scheduling a key that is already pending supersedes it; stale heap
/// entries are skipped when popped.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    heap: BinaryHeap<Reverse<(Instant, u64, K)>>,
    active: HashMap<K, u64>,
    generation: u64,
}

impl<K: Copy + Eq + Hash + Ord> DeadlineQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            active: HashMap::new(),
            generation: 0,
        }
    }

    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.generation += 1;
        self.active.insert(key, self.generation);
        self.heap.push(Reverse((deadline, self.generation, key)));
    }

    /// Returns whether the key was pending.
    pub fn cancel(&mut self, key: K) -> bool {
        self.active.remove(&key).is_some()
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.active.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Pop the earliest live deadline at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(K, Instant)> {
        while let Some(Reverse((deadline, generation, key))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if self.active.get(&key) == Some(&generation) {
                self.active.remove(&key);
                return Some((key, deadline));
            }
        }
        None
    }

    /// Earliest live deadline, if any.
    #[cfg(test)]
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, generation, key))) = self.heap.peek().copied() {
            if self.active.get(&key) == Some(&generation) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }
}

impl<K: Copy + Eq + Hash + Ord> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
