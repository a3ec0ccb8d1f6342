//! Event queue for accumulating timestamped events between flushes.
//!
//! All mutations go through one mutex, which makes the queue the single
//! serialization point between concurrent loggers, flush loops and
//! re-enqueues after failed sends. A popped event is handed to exactly one
//! caller; it only comes back through `reenqueue`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::event::TimestampedEvent;

/// An immutable slice of events extracted for one send attempt.
///
/// Events are ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    events: Vec<TimestampedEvent>,
}

impl Batch {
    pub fn new(events: Vec<TimestampedEvent>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[TimestampedEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimestampedEvent> {
        self.events.iter()
    }

    /// Event names in batch order, for log lines.
    pub fn names(&self) -> Vec<String> {
        self.events.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn into_events(self) -> Vec<TimestampedEvent> {
        self.events
    }

    /// Split off the event carrying `sequence`, keeping the others in order.
    pub fn remove_sequence(self, sequence: u64) -> (Option<TimestampedEvent>, Batch) {
        let mut events = self.events;
        let removed = events
            .iter()
            .position(|e| e.sequence() == sequence)
            .map(|index| events.remove(index));
        (removed, Batch::new(events))
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a TimestampedEvent;
    type IntoIter = std::slice::Iter<'a, TimestampedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Point-in-time view used for policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub count: usize,
    /// Age of the oldest event, zero when the queue is empty.
    pub oldest_age: Duration,
}

#[derive(Default)]
struct QueueInner {
    events: Vec<TimestampedEvent>,
    next_sequence: u64,
}

/// Ordered, thread-safe buffer of timestamped events.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning its arrival sequence number.
    pub fn add(&self, mut event: TimestampedEvent) {
        let mut inner = self.inner.lock();
        event.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.events.push(event);
    }

    /// Remove and return up to `max_size` of the oldest events.
    ///
    /// Age is decided by `occurred_at`, ties by arrival order. Events left
    /// behind keep their relative order. The selection and the removal
    /// happen under the same lock, so concurrent adds can neither be
    /// returned twice nor be lost.
    pub fn pop_batch(&self, max_size: usize) -> Batch {
        let mut inner = self.inner.lock();
        let take = max_size.min(inner.events.len());
        if take == 0 {
            return Batch::default();
        }

        let mut order: Vec<usize> = (0..inner.events.len()).collect();
        order.sort_by_key(|&i| {
            let event = &inner.events[i];
            (event.occurred_at(), event.sequence)
        });

        let mut slots: Vec<Option<TimestampedEvent>> =
            std::mem::take(&mut inner.events).into_iter().map(Some).collect();

        let mut batch = Vec::with_capacity(take);
        for &index in &order[..take] {
            if let Some(event) = slots[index].take() {
                batch.push(event);
            }
        }
        inner.events = slots.into_iter().flatten().collect();

        debug!(
            popped = batch.len(),
            remaining = inner.events.len(),
            "Popped batch from event queue"
        );

        Batch::new(batch)
    }

    /// Put a previously popped batch back after a failed send.
    ///
    /// Events keep their original timestamps and sequence numbers, so they
    /// are still the oldest on the next pop.
    pub fn reenqueue(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.events.extend(batch.into_events());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Capture time of the oldest queued event.
    pub fn oldest_occurred_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .events
            .iter()
            .map(TimestampedEvent::occurred_at)
            .min()
    }

    /// Age of the oldest event relative to `now`.
    ///
    /// Zero when the queue is empty or the oldest timestamp lies in the
    /// future.
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Duration {
        self.oldest_occurred_at()
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Count and oldest age read under a single lock.
    pub fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let inner = self.inner.lock();
        let oldest_age = inner
            .events
            .iter()
            .map(TimestampedEvent::occurred_at)
            .min()
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or(Duration::ZERO);

        QueueSnapshot {
            count: inner.events.len(),
            oldest_age,
        }
    }

    /// Copy of the queued events in storage order.
    pub fn events(&self) -> Vec<TimestampedEvent> {
        self.inner.lock().events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CustomEvent;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn create_test_event(name: &str, occurred_at: DateTime<Utc>) -> TimestampedEvent {
        TimestampedEvent::new(Arc::new(CustomEvent::new(name).unwrap()), occurred_at)
    }

    fn names(batch: &Batch) -> Vec<String> {
        batch.names()
    }

    #[test]
    fn test_pop_from_empty_queue() {
        let queue = EventQueue::new();
        let batch = queue.pop_batch(10);
        assert!(batch.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_more_than_available_empties_queue() {
        let queue = EventQueue::new();
        let now = Utc::now();
        for i in 0..3 {
            queue.add(create_test_event(&format!("e{}", i), now));
        }

        let batch = queue.pop_batch(10);
        assert_eq!(batch.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_respects_max_size() {
        let queue = EventQueue::new();
        let now = Utc::now();
        for i in 0..5 {
            queue.add(create_test_event(&format!("e{}", i), now));
        }

        let batch = queue.pop_batch(2);
        assert_eq!(names(&batch), vec!["e0", "e1"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_selects_oldest_by_timestamp() {
        let queue = EventQueue::new();
        let now = Utc::now();
        queue.add(create_test_event("newest", now));
        queue.add(create_test_event("oldest", now - ChronoDuration::seconds(305)));
        queue.add(create_test_event("middle", now - ChronoDuration::seconds(10)));

        let batch = queue.pop_batch(2);
        assert_eq!(names(&batch), vec!["oldest", "middle"]);

        let remaining: Vec<String> = queue.events().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(remaining, vec!["newest"]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let queue = EventQueue::new();
        let now = Utc::now();
        for name in ["a", "b", "c", "d"] {
            queue.add(create_test_event(name, now));
        }

        assert_eq!(names(&queue.pop_batch(3)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remaining_events_keep_relative_order() {
        let queue = EventQueue::new();
        let now = Utc::now();
        queue.add(create_test_event("x", now));
        queue.add(create_test_event("old", now - ChronoDuration::seconds(60)));
        queue.add(create_test_event("y", now));
        queue.add(create_test_event("z", now));

        queue.pop_batch(1);
        let remaining: Vec<String> = queue.events().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(remaining, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_reenqueued_events_are_popped_first_again() {
        let queue = EventQueue::new();
        let now = Utc::now();
        queue.add(create_test_event("first", now));
        queue.add(create_test_event("second", now));

        let batch = queue.pop_batch(2);
        queue.add(create_test_event("later", now));
        queue.reenqueue(batch);

        assert_eq!(queue.len(), 3);
        assert_eq!(names(&queue.pop_batch(2)), vec!["first", "second"]);
    }

    #[test]
    fn test_sequence_numbers_follow_arrival() {
        let queue = EventQueue::new();
        let now = Utc::now();
        queue.add(create_test_event("a", now));
        queue.add(create_test_event("b", now));

        let sequences: Vec<u64> = queue.events().iter().map(|e| e.sequence()).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn test_remove_sequence_splits_batch() {
        let queue = EventQueue::new();
        let now = Utc::now();
        for name in ["a", "b", "c"] {
            queue.add(create_test_event(name, now));
        }

        let (removed, rest) = queue.pop_batch(3).remove_sequence(1);
        assert_eq!(removed.map(|e| e.name().to_string()), Some("b".to_string()));
        assert_eq!(names(&rest), vec!["a", "c"]);

        let (missing, rest) = rest.remove_sequence(42);
        assert!(missing.is_none());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_snapshot_and_oldest_age() {
        let queue = EventQueue::new();
        let now = Utc::now();

        let empty = queue.snapshot(now);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.oldest_age, Duration::ZERO);

        queue.add(create_test_event("a", now - ChronoDuration::seconds(120)));
        queue.add(create_test_event("b", now));

        let snapshot = queue.snapshot(now);
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.oldest_age, Duration::from_secs(120));
        assert_eq!(queue.oldest_age(now), Duration::from_secs(120));
    }

    #[test]
    fn test_future_timestamp_has_zero_age() {
        let queue = EventQueue::new();
        let now = Utc::now();
        queue.add(create_test_event("future", now + ChronoDuration::seconds(600)));
        assert_eq!(queue.oldest_age(now), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_add_and_pop_never_duplicates_or_loses() {
        let queue = Arc::new(EventQueue::new());
        let producers = 4;
        let per_producer = 250;

        let mut handles = Vec::new();
        for p in 0..producers {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    queue.add(create_test_event(&format!("{}-{}", p, i), Utc::now()));
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let batch = queue.pop_batch(7);
                    seen.extend(batch.names());
                    std::thread::yield_now();
                }
                seen
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let mut all: Vec<String> = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all.extend(queue.pop_batch(usize::MAX).names());

        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), producers * per_producer);
        assert_eq!(unique.len(), all.len());
        assert!(queue.is_empty());
    }
}
