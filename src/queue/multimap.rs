//! The default event queue: a binary heap behind a `parking_lot::Mutex`,
//! named after the original implementation's `std::multimap`-backed variant
//! (§4.1, "plain multimap implementation"). Works on any platform; the
//! `io-uring` feature's `RingQueue` trades this for lower syscall overhead on
//! Linux at the cost of portability.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::EventQueue;
use crate::event::{Event, Priority};
use crate::types::{EventId, IdCounter};

/// Wraps an `Event` for `BinaryHeap` ordering. `BinaryHeap` is a max-heap;
/// since lower `Priority` values must come out first, and lower `EventId`
/// must win FIFO ties, the `Ord` impl below is reversed relative to the
/// natural `(priority, id)` tuple order — the same reversed-for-min-heap
/// trick the teacher's `PriorityItem` uses for its ready queue.
struct QueuedEvent(Event);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority() == other.0.priority() && self.0.id() == other.0.id()
    }
}
impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority()
            .cmp(&self.0.priority())
            .then_with(|| other.0.id().cmp(&self.0.id()))
    }
}

/// Default `EventQueue` implementation: correct and portable, not the
/// lowest-latency option. Good enough for every test and for hosts that don't
/// need the `io-uring` feature.
pub struct MultimapQueue {
    heap: Mutex<BinaryHeap<QueuedEvent>>,
    ids: IdCounter,
    notify: Notify,
    quitting: AtomicBool,
}

impl MultimapQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            ids: IdCounter::new(),
            notify: Notify::new(),
            quitting: AtomicBool::new(false),
        }
    }
}

impl Default for MultimapQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultimapQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimapQueue")
            .field("size", &self.heap.lock().len())
            .field("quitting", &self.quitting.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl EventQueue for MultimapQueue {
    fn push(&self, event: Event) -> EventId {
        let id = EventId::from_raw(self.ids.next());
        let event = event.reassign_id(id);
        self.heap.lock().push(QueuedEvent(event));
        self.notify.notify_one();
        id
    }

    fn pop_highest_priority(&self) -> Option<Event> {
        self.heap.lock().pop().map(|queued| queued.0)
    }

    fn empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn size(&self) -> usize {
        self.heap.lock().len()
    }

    fn quit(&self) {
        self.quitting.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }

    fn is_quitting(&self) -> bool {
        self.quitting.load(AtomicOrdering::Acquire)
    }

    fn notified(&self) -> super::futures_lite_notified::Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceId;

    #[test]
    fn quit_is_idempotent_and_observable() {
        let queue = MultimapQueue::new();
        assert!(!queue.is_quitting());
        queue.quit();
        queue.quit();
        assert!(queue.is_quitting());
    }

    #[test]
    fn empty_and_size_track_contents() {
        let queue = MultimapQueue::new();
        assert!(queue.empty());
        queue.push(Event::new(
            EventId::from_raw(0),
            ServiceId::from_raw(1),
            Priority::USER_DEFAULT,
            1u8,
        ));
        assert!(!queue.empty());
        assert_eq!(queue.size(), 1);
        queue.pop_highest_priority();
        assert!(queue.empty());
    }

    #[test]
    fn lower_priority_number_pops_first() {
        let queue = MultimapQueue::new();
        let low_urgency = queue.push(Event::new(
            EventId::from_raw(0),
            ServiceId::from_raw(1),
            Priority::USER_DEFAULT,
            (),
        ));
        let high_urgency = queue.push(Event::new(
            EventId::from_raw(0),
            ServiceId::from_raw(1),
            Priority::LIFECYCLE,
            (),
        ));
        assert!(high_urgency < low_urgency);
        let first = queue.pop_highest_priority().unwrap();
        assert_eq!(first.id(), high_urgency);
        let second = queue.pop_highest_priority().unwrap();
        assert_eq!(second.id(), low_urgency);
    }
}
