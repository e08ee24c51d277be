//! The `io-uring`-backed event queue (§4.1, "ring buffer implementation").
//!
//! The event *payload* never goes through the ring — `io_uring` submission
//! queue entries carry fixed-size fields meant for syscall arguments, not
//! arbitrary Rust values, so the payload travels the same `crossbeam_channel`
//! path a cross-thread push always needs. What the ring actually backs is
//! the **wakeup**: every `push` submits a `Nop` SQE (per §9, "use the
//! kernel's submission/completion rings... for user events" means the ring
//! signals that something completed, not that it stores the something) and
//! every drain reaps the matching CQE, the same local-heap-plus-ring-as-
//! wakeup split `examples/thomasbarrett-io-uring-async` and
//! `examples/Dennis-Krasnov-Uringy` use between a local slab and the
//! completion queue (see `DESIGN.md`).
//!
//! This module needs `unsafe` to push a raw `squeue::Entry` onto the
//! submission queue, which is why the crate-level `unsafe_code` lint is
//! `warn` rather than `deny` (see `DESIGN.md`).

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crossbeam_channel::{Receiver, Sender};
use io_uring::{opcode, IoUring};
use tokio::sync::Notify;

use super::EventQueue;
use crate::event::{Event, Priority};
use crate::types::{EventId, IdCounter, UringQueueConfig};

/// Local, single-threaded priority order. The `io_uring` submission/
/// completion rings themselves carry no priority concept — entries surface
/// in completion order — so `RingQueue` still keeps its own heap of
/// already-completed events and uses the ring purely as the wakeup
/// mechanism for cross-thread pushes, exactly as the teacher's ring-buffer
/// reference implementation layers a reactor under an ordinary local queue.
struct QueuedEvent(Event);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority() == other.0.priority() && self.0.id() == other.0.id()
    }
}
impl Eq for QueuedEvent {}
impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .priority()
            .cmp(&self.0.priority())
            .then_with(|| other.0.id().cmp(&self.0.id()))
    }
}

/// An `io_uring`-backed event queue. Only the owning kernel thread may call
/// `pop_highest_priority`; `push` is safe from any thread.
pub struct RingQueue {
    /// The raw ring. Only ever touched from the owning thread, via `&self`
    /// interior mutability, matching the single-consumer contract.
    ring: RefCell<IoUring>,
    local: RefCell<BinaryHeap<QueuedEvent>>,
    cross_thread_tx: Sender<Event>,
    cross_thread_rx: Receiver<Event>,
    ids: IdCounter,
    notify: Notify,
    quitting: AtomicBool,
}

impl RingQueue {
    /// Build a ring sized per `config`. Fails if the host kernel cannot
    /// allocate a ring of the requested size (e.g. `RLIMIT_MEMLOCK`).
    pub fn new(config: &UringQueueConfig) -> crate::types::Result<Self> {
        let ring = IoUring::new(config.entries)?;
        let (cross_thread_tx, cross_thread_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            ring: RefCell::new(ring),
            local: RefCell::new(BinaryHeap::new()),
            cross_thread_tx,
            cross_thread_rx,
            ids: IdCounter::new(),
            notify: Notify::new(),
            quitting: AtomicBool::new(false),
        })
    }

    /// Drain anything queued by other threads into the local heap, then reap
    /// every completion queue entry the matching `push` calls submitted —
    /// the ring's role here is purely "something was pushed", so the CQE's
    /// contents are never inspected, only drained so the completion queue
    /// doesn't fill up.
    fn drain_cross_thread(&self) {
        let mut local = self.local.borrow_mut();
        while let Ok(event) = self.cross_thread_rx.try_recv() {
            local.push(QueuedEvent(event));
        }
        drop(local);

        let mut ring = self.ring.borrow_mut();
        let reaped = ring.completion().count();
        tracing::trace!(reaped, "drained io_uring completion queue");
    }

    /// Submit a `Nop` entry as a wakeup signal for this push. The SQE
    /// carries no buffer pointers for the kernel to dereference, so pushing
    /// it is sound regardless of how long the `Entry` value itself lives.
    fn submit_wakeup(&self) {
        let entry = opcode::Nop::new().build();
        let mut ring = self.ring.borrow_mut();
        // SAFETY: `Nop` has no associated buffers; the kernel never reads or
        // writes through a pointer carried by this entry.
        let pushed = unsafe { ring.submission().push(&entry) };
        if pushed.is_err() {
            tracing::warn!("io_uring submission queue full, dropping wakeup entry");
        }
        if let Err(err) = ring.submit() {
            tracing::warn!(%err, "io_uring submit failed");
        }
    }
}

impl std::fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingQueue")
            .field("local_len", &self.local.borrow().len())
            .field("quitting", &self.quitting.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl EventQueue for RingQueue {
    fn push(&self, event: Event) -> EventId {
        let id = EventId::from_raw(self.ids.next());
        let event = event.reassign_id(id);
        // The payload always goes through the channel — the ring only ever
        // carries the wakeup, never event data (see module doc comment).
        let _ = self.cross_thread_tx.send(event);
        self.submit_wakeup();
        self.notify.notify_one();
        id
    }

    fn pop_highest_priority(&self) -> Option<Event> {
        self.drain_cross_thread();
        self.local.borrow_mut().pop().map(|queued| queued.0)
    }

    fn empty(&self) -> bool {
        self.drain_cross_thread();
        self.local.borrow().is_empty()
    }

    fn size(&self) -> usize {
        self.drain_cross_thread();
        self.local.borrow().len()
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
