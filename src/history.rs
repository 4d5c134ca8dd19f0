//! Bounded detection history.
//!
//! The history is the only mutable state shared between streaming sessions.
//! It keeps the last `capacity` detection records in insertion order and
//! evicts the oldest first. Every clone shares the same ring.
//!
//! The lock is held only for the push or the copy-out; detection itself
//! always runs outside of it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of records kept when no capacity is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// One recorded detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub label: String,
    pub confidence: f32,
    /// Seconds since the UNIX epoch.
    pub timestamp: f64,
}

impl DetectionRecord {
    pub fn new(label: impl Into<String>, confidence: f32, timestamp: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            timestamp,
        }
    }
}

/// Shared, bounded FIFO of recent detections.
#[derive(Clone, Debug)]
pub struct DetectionHistory {
    inner: Arc<Mutex<VecDeque<DetectionRecord>>>,
    capacity: usize,
}

impl DetectionHistory {
    /// Create an empty history. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one record at the tail, evicting from the head past capacity.
    pub fn append(&self, record: DetectionRecord) {
        let mut ring = self.lock();
        push_bounded(&mut ring, record, self.capacity);
    }

    /// Append all records of one frame under a single lock acquisition, so
    /// records from one frame are never interleaved with another writer's.
    pub fn append_batch<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = DetectionRecord>,
    {
        let mut ring = self.lock();
        let mut appended = 0;
        for record in records {
            push_bounded(&mut ring, record, self.capacity);
            appended += 1;
        }
        appended
    }

    /// Ordered copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<DetectionRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DetectionRecord>> {
        // A writer that panicked mid-push leaves the ring structurally valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DetectionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn push_bounded(ring: &mut VecDeque<DetectionRecord>, mut record: DetectionRecord, capacity: usize) {
    // Timestamps never go backwards inside the ring, even if the wall clock does.
    if let Some(tail) = ring.back() {
        if record.timestamp < tail.timestamp {
            record.timestamp = tail.timestamp;
        }
    }
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    fn record(i: usize) -> DetectionRecord {
        DetectionRecord::new(format!("obj{i}"), 0.5, i as f64)
    }

    #[test]
    fn snapshot_keeps_last_records_in_order() {
        for total in [0usize, 1, 49, 50, 51, 137] {
            let history = DetectionHistory::default();
            for i in 0..total {
                history.append(record(i));
            }
            let snapshot = history.snapshot();
            let expected_len = total.min(DEFAULT_HISTORY_CAPACITY);
            assert_eq!(snapshot.len(), expected_len, "total={total}");
            let expected: Vec<_> = (total - expected_len..total).map(record).collect();
            assert_eq!(snapshot, expected, "total={total}");
        }
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let history = DetectionHistory::new(3);
        history.append(record(1));
        let first = history.snapshot();
        let second = history.snapshot();
        assert_eq!(first, second);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn batch_append_respects_capacity() {
        let history = DetectionHistory::new(4);
        let appended = history.append_batch((0..6).map(record));
        assert_eq!(appended, 6);
        let labels: Vec<_> = history.snapshot().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["obj2", "obj3", "obj4", "obj5"]);
    }

    #[test]
    fn timestamps_are_clamped_non_decreasing() {
        let history = DetectionHistory::new(8);
        history.append(DetectionRecord::new("a", 0.9, 10.0));
        history.append(DetectionRecord::new("b", 0.9, 5.0));
        let snapshot = history.snapshot();
        assert_eq!(snapshot[1].timestamp, 10.0);
        assert_eq!(snapshot[1].label, "b");
    }

    #[test]
    fn confidence_is_preserved_exactly() {
        let history = DetectionHistory::new(2);
        history.append(DetectionRecord::new("drone", 0.123_456_79, 1.0));
        assert_eq!(history.snapshot()[0].confidence, 0.123_456_79_f32);
    }

    #[test]
    fn concurrent_writers_keep_per_writer_order() {
        let history = DetectionHistory::new(DEFAULT_HISTORY_CAPACITY);
        let writers = 6;
        let per_writer = 200;

        let mut handles = Vec::new();
        for w in 0..writers {
            let history = history.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_writer {
                    history.append(DetectionRecord::new(format!("{w}:{i}"), 0.5, 0.0));
                }
            }));
        }
        for _ in 0..3 {
            let history = history.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = history.snapshot();
                    assert!(snapshot.len() <= DEFAULT_HISTORY_CAPACITY);
                    assert_per_writer_order(&snapshot);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), DEFAULT_HISTORY_CAPACITY);
        assert_per_writer_order(&snapshot);
    }

    fn assert_per_writer_order(snapshot: &[DetectionRecord]) {
        let mut last_seen: HashMap<String, i64> = HashMap::new();
        for rec in snapshot {
            let (writer, seq) = rec.label.split_once(':').unwrap();
            let seq: i64 = seq.parse().unwrap();
            let prev = last_seen.insert(writer.to_string(), seq).unwrap_or(-1);
            assert!(seq > prev, "writer {writer} out of order or duplicated");
        }
    }
}
