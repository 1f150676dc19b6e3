//! In-memory FIFO of ready-to-send records.
//!
//! Two insertion points: [`Queue::push_tail`] for ordinary producer intake,
//! [`Queue::push_head`] for self-log records and drain-failure retry. No
//! size bound is enforced here — see [`Queue::set_capacity`] for the
//! operator-configurable cap: unbounded growth under a sustained outage is
//! a memory-leak vector, so a cap is available, but it defaults to `None`
//! to preserve unbounded behavior unless an operator opts in.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

/// An ordered sequence of records awaiting upstream delivery.
#[derive(Debug, Default)]
pub struct Queue {
    records: VecDeque<Vec<u8>>,
    capacity: Option<usize>,
    drop_policy: DropPolicy,
    dropped: u64,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Vec<u8>>) -> Self {
        Self {
            records: records.into(),
            ..Self::default()
        }
    }

    /// Configure an optional capacity and the policy applied when a push
    /// would exceed it. `None` (the default) preserves the reference
    /// broker's unbounded growth.
    pub fn set_capacity(&mut self, capacity: Option<usize>, policy: DropPolicy) {
        self.capacity = capacity;
        self.drop_policy = policy;
    }

    /// Number of records dropped by the capacity policy since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append to the tail — ordinary producer intake.
    pub fn push_tail(&mut self, record: Vec<u8>) {
        if let Some(cap) = self.capacity {
            if self.records.len() >= cap {
                match self.drop_policy {
                    DropPolicy::DropNewest => {
                        self.dropped += 1;
                        return;
                    }
                    DropPolicy::DropOldest => {
                        self.records.pop_front();
                        self.dropped += 1;
                    }
                }
            }
        }
        self.records.push_back(record);
    }

    /// Prepend to the head — self-log records and drain-failure retry.
    /// Bypasses the capacity cap: urgent records are never dropped to make
    /// room for themselves.
    pub fn push_head(&mut self, record: Vec<u8>) {
        self.records.push_front(record);
    }

    /// Remove and return the head record, if any.
    pub fn pop_head(&mut self) -> Option<Vec<u8>> {
        self.records.pop_front()
    }

    /// Snapshot all records in FIFO order without draining the queue.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_ordering() {
        let mut q = Queue::new();
        q.push_tail(b"a".to_vec());
        q.push_tail(b"b".to_vec());
        q.push_tail(b"c".to_vec());
        assert_eq!(q.pop_head().unwrap(), b"a");
        assert_eq!(q.pop_head().unwrap(), b"b");
        assert_eq!(q.pop_head().unwrap(), b"c");
        assert!(q.pop_head().is_none());
    }

    #[test]
    fn drain_failure_reinserts_at_head_preserving_order() {
        let mut q = Queue::new();
        q.push_tail(b"first".to_vec());
        q.push_tail(b"second".to_vec());

        let popped = q.pop_head().unwrap();
        assert_eq!(popped, b"first");
        // Simulate a failed send: restore to the head.
        q.push_head(popped);

        assert_eq!(q.pop_head().unwrap(), b"first");
        assert_eq!(q.pop_head().unwrap(), b"second");
    }

    #[test]
    fn self_log_overtakes_buffered_traffic() {
        let mut q = Queue::new();
        q.push_tail(b"producer-1".to_vec());
        q.push_tail(b"producer-2".to_vec());
        q.push_head(b"self-log".to_vec());

        assert_eq!(q.pop_head().unwrap(), b"self-log");
        assert_eq!(q.pop_head().unwrap(), b"producer-1");
        assert_eq!(q.pop_head().unwrap(), b"producer-2");
    }

    #[test]
    fn unbounded_by_default() {
        let mut q = Queue::new();
        for i in 0..10_000u32 {
            q.push_tail(i.to_be_bytes().to_vec());
        }
        assert_eq!(q.len(), 10_000);
        assert_eq!(q.dropped_count(), 0);
    }

    #[test]
    fn capacity_cap_drops_oldest() {
        let mut q = Queue::new();
        q.set_capacity(Some(2), DropPolicy::DropOldest);
        q.push_tail(b"a".to_vec());
        q.push_tail(b"b".to_vec());
        q.push_tail(b"c".to_vec());
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop_head().unwrap(), b"b");
    }

    #[test]
    fn capacity_cap_drops_newest() {
        let mut q = Queue::new();
        q.set_capacity(Some(2), DropPolicy::DropNewest);
        q.push_tail(b"a".to_vec());
        q.push_tail(b"b".to_vec());
        q.push_tail(b"c".to_vec());
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.snapshot(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
