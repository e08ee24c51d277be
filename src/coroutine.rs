//! Coroutine integration (§4.6, §4.8).
//!
//! Rust's `Future` already is the lazily-advanced coroutine frame the
//! distilled spec describes, so this module doesn't implement generators —
//! it provides the three awaitable kinds (`EventWait`, `ServiceWait`,
//! `ManualResetEvent::wait`), the waiter table that coalesces concurrent
//! awaiters of the same event, and the scope-stack guard that makes "scope
//! at resume equals scope at suspend" hold across an `.await` point.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::event::builtin::{ContinuableEvent, PromiseId};
use crate::event::{Event, Priority};
use crate::queue::EventQueue;
use crate::types::{EventId, IdCounter, ServiceId, TypeTag};

thread_local! {
    /// Stack of services whose execution scope is currently active on this
    /// thread. Per §9's "thread-local pointer identifies the currently
    /// running kernel" guidance, generalized to a stack so nested
    /// `RunFunctionEvent` dispatches (a handler that itself pushes and
    /// synchronously drains another event) still attribute correctly.
    static SCOPE_STACK: RefCell<Vec<ServiceId>> = const { RefCell::new(Vec::new()) };
}

/// The service id attributed to whatever is currently executing on this
/// thread, if any.
pub fn current_scope() -> Option<ServiceId> {
    SCOPE_STACK.with(|stack| stack.borrow().last().copied())
}

/// RAII guard: pushes `service` onto the scope stack on construction, pops
/// it on drop. The scheduler loop wraps every handler invocation and every
/// coroutine resume in one of these, so `current_scope()` is correct inside
/// arbitrarily nested synchronous calls, and popped correctly even if the
/// handler panics (panics are caught one layer up, by `with_recovery`, but
/// the stack must not leak an entry either way).
pub struct ScopeGuard;

impl ScopeGuard {
    pub fn enter(service: ServiceId) -> Self {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(service));
        Self
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A manual-reset event: starts unset, `set()` wakes every waiter and
/// leaves it set (unlike a one-shot channel, `wait()` after `set()`
/// resolves immediately), `reset()` returns it to unset.
#[derive(Default)]
pub struct ManualResetEvent {
    inner: RefCell<ManualResetEventInner>,
}

#[derive(Default)]
struct ManualResetEventInner {
    set: bool,
    wakers: Vec<Waker>,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            inner.set = true;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn reset(&self) {
        self.inner.borrow_mut().set = false;
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().set
    }

    pub fn wait(&self) -> ManualResetEventWait<'_> {
        ManualResetEventWait { event: self }
    }
}

pub struct ManualResetEventWait<'a> {
    event: &'a ManualResetEvent,
}

impl<'a> Future for ManualResetEventWait<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.event.inner.borrow_mut();
        if inner.set {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Outcome delivered to everything awaiting a given event id.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The event completed normally.
    Completed,
    /// The awaiting service (or its kernel) is shutting down before the
    /// event resolved.
    Quitting,
    /// The awaited service failed to start, carrying the failure reason.
    Failed(String),
}

/// One entry in the waiter table: every coroutine currently suspended on a
/// particular event id, plus the outcome once it's known.
#[derive(Default)]
struct WaiterEntry {
    wakers: Vec<Waker>,
    outcome: Option<WaitOutcome>,
}

/// `HashMap<EventId, EventWaiter>` per §4.8: coalesces concurrent awaiters of
/// the same event id onto one table entry instead of requeuing the event.
#[derive(Default)]
pub struct WaiterTable {
    waiters: RefCell<HashMap<EventId, WaiterEntry>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every waiter on `event_id` with `outcome`. Idempotent: a
    /// second resolution with a different outcome is ignored and logged,
    /// since an event id should only ever settle once.
    pub fn resolve(&self, event_id: EventId, outcome: WaitOutcome) {
        let wakers = {
            let mut waiters = self.waiters.borrow_mut();
            let entry = waiters.entry(event_id).or_default();
            if entry.outcome.is_some() {
                tracing::debug!(event = %event_id, "waiter entry already resolved, ignoring");
                return;
            }
            entry.outcome = Some(outcome);
            std::mem::take(&mut entry.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn wait(&self, event_id: EventId) -> EventWait<'_> {
        EventWait {
            table: self,
            event_id,
        }
    }

    /// Resolve every entry that hasn't already settled, with `outcome`.
    /// Used during the quit drain (§4.3 step 3) to release any coroutine
    /// still awaiting an event that will never complete.
    pub fn resolve_all_pending(&self, outcome: WaitOutcome) {
        let mut waiters = self.waiters.borrow_mut();
        for entry in waiters.values_mut() {
            if entry.outcome.is_none() {
                entry.outcome = Some(outcome.clone());
                for waker in std::mem::take(&mut entry.wakers) {
                    waker.wake();
                }
            }
        }
    }
}

/// An awaitable for "event `event_id` has resolved", coalescing with any
/// other `EventWait` on the same id rather than creating a second queue
/// entry (§4.8).
pub struct EventWait<'a> {
    table: &'a WaiterTable,
    event_id: EventId,
}

impl<'a> Future for EventWait<'a> {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let mut waiters = self.table.waiters.borrow_mut();
        let entry = waiters.entry(self.event_id).or_default();
        if let Some(outcome) = &entry.outcome {
            Poll::Ready(outcome.clone())
        } else {
            entry.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Owned variant of `EventWait`: holds an `Rc` clone of the table rather than
/// borrowing it, so the future can be boxed into a continuation frame that
/// outlives the stack frame that created it (§4.6's suspension points are not
/// scoped to a borrow).
pub struct EventWaitOwned {
    table: Rc<WaiterTable>,
    event_id: EventId,
}

impl Future for EventWaitOwned {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let mut waiters = self.table.waiters.borrow_mut();
        let entry = waiters.entry(self.event_id).or_default();
        if let Some(outcome) = &entry.outcome {
            Poll::Ready(outcome.clone())
        } else {
            entry.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl WaiterTable {
    /// Like `wait`, but for a table held behind an `Rc` so the returned
    /// future is not tied to the table's borrow lifetime.
    pub fn wait_owned(self: &Rc<Self>, event_id: EventId) -> EventWaitOwned {
        EventWaitOwned {
            table: Rc::clone(self),
            event_id,
        }
    }
}

/// Per-waiter state for a `ServiceWait`, shared between the future and
/// whichever `ServiceWaiterTable` entry it registered into.
struct ServiceWaitState {
    ready: bool,
    waker: Option<Waker>,
}

/// §4.6 item 2: `HashMap<(ServiceId, TypeTag), _>` of everything suspended on
/// "service reaches the transition that would emit this built-in event
/// type". The kernel calls `notify` at the same point it pushes the event
/// in question for that service (e.g. `DependencyOnlineEvent` once a service
/// reaches `Active`).
///
/// A notified entry is drained and removed rather than left "set" — unlike
/// `ManualResetEvent`, a service's transitions repeat across restarts, so a
/// `wait_for_service` call registered *after* a notification must suspend
/// until the *next* occurrence, not resolve against a stale one.
#[derive(Default)]
pub struct ServiceWaiterTable {
    waiters: RefCell<HashMap<(ServiceId, TypeTag), Vec<Rc<RefCell<ServiceWaitState>>>>>,
}

impl ServiceWaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake and clear every waiter registered for `(service, event_type)`.
    pub fn notify(&self, service: ServiceId, event_type: TypeTag) {
        let Some(states) = self.waiters.borrow_mut().remove(&(service, event_type)) else {
            return;
        };
        for state in states {
            let mut state = state.borrow_mut();
            state.ready = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }

    /// `wait_for_service(id, event-type)` (§4.6 item 2, §6): suspend until
    /// `service` reaches the transition that would emit a `event_type`
    /// event.
    pub fn wait(self: &Rc<Self>, service: ServiceId, event_type: TypeTag) -> ServiceWait {
        ServiceWait {
            table: Rc::clone(self),
            service,
            event_type,
            state: Rc::new(RefCell::new(ServiceWaitState { ready: false, waker: None })),
            registered: false,
        }
    }
}

/// Awaitable for "`service` reached the transition that would emit
/// `event_type`" — the second of the three kernel awaitable kinds (§4.6).
pub struct ServiceWait {
    table: Rc<ServiceWaiterTable>,
    service: ServiceId,
    event_type: TypeTag,
    state: Rc<RefCell<ServiceWaitState>>,
    registered: bool,
}

impl Future for ServiceWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        {
            let mut state = this.state.borrow_mut();
            if state.ready {
                return Poll::Ready(());
            }
            state.waker = Some(cx.waker().clone());
        }
        if !this.registered {
            this.table
                .waiters
                .borrow_mut()
                .entry((this.service, this.event_type))
                .or_default()
                .push(Rc::clone(&this.state));
            this.registered = true;
        }
        Poll::Pending
    }
}

/// Drives a `ContinuableEvent` back through the owning kernel's queue
/// instead of resuming the future directly from the waker — resumption must
/// re-enter at the suspension point's priority (§4.6), not at whatever
/// priority the I/O completion or channel that woke it happened to run at.
///
/// `Waker` requires `Send + Sync`even though this kernel is strictly
/// single-threaded; the kernel never clones a `Waker` across an OS thread
/// boundary (§5: "no two threads ever touch the same service"), so the
/// `Rc<dyn EventQueue>` inside is never actually accessed concurrently.
pub struct ContinuationWaker {
    queue: Rc<dyn EventQueue>,
    origin: ServiceId,
    promise_id: PromiseId,
}

// SAFETY: see struct doc comment — only ever woken on the kernel's own
// thread, despite the `Send + Sync` bound `std::task::Wake` requires.
unsafe impl Send for ContinuationWaker {}
unsafe impl Sync for ContinuationWaker {}

impl ContinuationWaker {
    pub fn new(queue: Rc<dyn EventQueue>, origin: ServiceId, promise_id: PromiseId) -> Self {
        Self { queue, origin, promise_id }
    }

    pub fn into_waker(self) -> Waker {
        Waker::from(Arc::new(self))
    }
}

impl Wake for ContinuationWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(Event::new(
            EventId::from_raw(0),
            self.origin,
            Priority::lifecycle_offset(1),
            ContinuableEvent { promise_id: self.promise_id },
        ));
    }
}

/// A suspended coroutine frame: the future itself plus the
/// service-execution-scope it was running under when it suspended (§3, §8's
/// "scope attribution" invariant).
pub type SuspendedFrame = (ServiceId, Pin<Box<dyn Future<Output = ()>>>);

/// Kernel-owned, promise-id-keyed map of suspended coroutine frames (§9).
/// `take`/`store` are the only operations the scheduler loop needs: pop a
/// frame out to poll it, push it back if still `Pending`.
#[derive(Default)]
pub struct ContinuationTable {
    ids: IdCounter,
    frames: RefCell<HashMap<PromiseId, SuspendedFrame>>,
}

impl ContinuationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_promise_id(&self) -> PromiseId {
        PromiseId::from_raw(self.ids.next())
    }

    pub fn store(&self, id: PromiseId, scope: ServiceId, future: Pin<Box<dyn Future<Output = ()>>>) {
        self.frames.borrow_mut().insert(id, (scope, future));
    }

    pub fn take(&self, id: PromiseId) -> Option<SuspendedFrame> {
        self.frames.borrow_mut().remove(&id)
    }

    /// Drop every frame attributed to `scope`. Called when a service
    /// uninstalls (§9: "dropped when the originating service uninstalls,
    /// deallocating their frame exactly once").
    pub fn drop_scope(&self, scope: ServiceId) {
        self.frames.borrow_mut().retain(|_, (owner, _)| *owner != scope);
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }

    /// Abandon every suspended frame. Called during the quit drain (§4.3
    /// step 3) once the drain deadline passes — an abandoned frame is simply
    /// dropped, not polled to completion, since whatever it was waiting on
    /// is assumed unavailable during shutdown.
    pub fn clear(&self) {
        self.frames.borrow_mut().clear();
    }
}

impl std::fmt::Debug for ContinuationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationTable").field("suspended", &self.len()).finish()
    }
}

impl Clone for WaitOutcome {
    fn clone(&self) -> Self {
        match self {
            WaitOutcome::Completed => WaitOutcome::Completed,
            WaitOutcome::Quitting => WaitOutcome::Quitting,
            WaitOutcome::Failed(reason) => WaitOutcome::Failed(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_guard_tracks_current_scope_and_pops_on_drop() {
        assert_eq!(current_scope(), None);
        {
            let _guard = ScopeGuard::enter(ServiceId::from_raw(1));
            assert_eq!(current_scope(), Some(ServiceId::from_raw(1)));
        }
        assert_eq!(current_scope(), None);
    }

    #[test]
    fn nested_scope_guards_restore_outer_scope() {
        let _outer = ScopeGuard::enter(ServiceId::from_raw(1));
        {
            let _inner = ScopeGuard::enter(ServiceId::from_raw(2));
            assert_eq!(current_scope(), Some(ServiceId::from_raw(2)));
        }
        assert_eq!(current_scope(), Some(ServiceId::from_raw(1)));
    }

    #[tokio::test]
    async fn manual_reset_event_wait_resolves_after_set() {
        let event = ManualResetEvent::new();
        assert!(!event.is_set());
        event.set();
        event.wait().await;
        event.reset();
        assert!(!event.is_set());
    }

    #[tokio::test]
    async fn waiter_table_coalesces_two_waits_on_same_event() {
        let table = WaiterTable::new();
        let id = EventId::from_raw(1);
        table.resolve(id, WaitOutcome::Completed);
        let outcome_a = table.wait(id).await;
        let outcome_b = table.wait(id).await;
        assert!(matches!(outcome_a, WaitOutcome::Completed));
        assert!(matches!(outcome_b, WaitOutcome::Completed));
    }

    #[tokio::test]
    async fn resolve_all_pending_releases_unresolved_waiters_only() {
        let table = WaiterTable::new();
        let already = EventId::from_raw(1);
        let pending = EventId::from_raw(2);
        table.resolve(already, WaitOutcome::Completed);

        // Register a waiter on `pending` by polling it once without
        // resolving; `wait` itself does the registration on first poll via
        // `wait().await` on a task, so drive it by hand via a no-op waker.
        let outcome_already = table.wait(already).await;
        assert!(matches!(outcome_already, WaitOutcome::Completed));

        table.resolve_all_pending(WaitOutcome::Quitting);
        let outcome_pending = table.wait(pending).await;
        assert!(matches!(outcome_pending, WaitOutcome::Quitting));
    }

    #[tokio::test]
    async fn owned_wait_resolves_through_rc_handle() {
        let table = Rc::new(WaiterTable::new());
        let id = EventId::from_raw(7);
        table.resolve(id, WaitOutcome::Failed("boom".to_string()));
        let outcome = table.wait_owned(id).await;
        assert!(matches!(outcome, WaitOutcome::Failed(reason) if reason == "boom"));
    }

    #[test]
    fn continuation_table_stores_and_takes_by_promise_id() {
        let table = ContinuationTable::new();
        let id = table.next_promise_id();
        let scope = ServiceId::from_raw(3);
        table.store(id, scope, Box::pin(async {}));
        assert_eq!(table.len(), 1);

        let (owner, _future) = table.take(id).expect("frame was stored");
        assert_eq!(owner, scope);
        assert!(table.is_empty());
        assert!(table.take(id).is_none());
    }

    #[test]
    fn continuation_table_drop_scope_removes_only_that_services_frames() {
        let table = ContinuationTable::new();
        let keep = table.next_promise_id();
        let drop_me = table.next_promise_id();
        table.store(keep, ServiceId::from_raw(1), Box::pin(async {}));
        table.store(drop_me, ServiceId::from_raw(2), Box::pin(async {}));

        table.drop_scope(ServiceId::from_raw(2));

        assert_eq!(table.len(), 1);
        assert!(table.take(keep).is_some());
    }

    #[tokio::test]
    async fn continuation_waker_pushes_continuable_event_on_wake() {
        let queue: Rc<dyn EventQueue> = Rc::new(crate::queue::MultimapQueue::new());
        let origin = ServiceId::from_raw(9);
        let promise_id = PromiseId::from_raw(1);
        let waker = ContinuationWaker::new(queue.clone(), origin, promise_id).into_waker();

        assert!(queue.empty());
        waker.wake();
        assert!(!queue.empty());

        let event = queue.pop_highest_priority().expect("waker pushed an event");
        assert_eq!(event.origin(), origin);
        assert_eq!(event.priority(), Priority::lifecycle_offset(1));
        let payload = event.downcast::<ContinuableEvent>().expect("payload is ContinuableEvent");
        assert_eq!(payload.promise_id, promise_id);
    }
}
