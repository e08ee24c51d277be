//! Events, priorities, and the built-in event catalogue (§3, §6).
//!
//! An `Event` is an owned, heap-allocated record: id, originating service,
//! priority, a stable `TypeTag`, and a type-erased payload. A `push`
//! transfers ownership to the queue, which transfers it to whichever handler
//! ends up running it — there is exactly one owner at every point in an
//! event's life.

use std::any::Any;
use std::fmt;

use crate::types::{EventId, ServiceId, TypeTag};

/// Event priority. Lower values are delivered earlier ("lower = earlier",
/// per §3). Kernel-internal events live in a fixed reserved low band so that
/// lifecycle transitions preempt user work; `INSERT_SERVICE` is lower still
/// so a newly created service is registered before anything can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Priority(u64);

impl Priority {
    /// Highest-effective-priority band: `InsertServiceEvent` only. Ensures a
    /// service is in the registry before any `DependencyOnlineEvent` that
    /// depends on it is observed (§4.5 ordering invariant).
    pub const INSERT_SERVICE: Priority = Priority(0);

    /// Reserved band for kernel lifecycle events (Dependency{On,Off}line,
    /// Start/Stop/RemoveService, Continuable*, Quit, Remove*Event).
    pub const LIFECYCLE: Priority = Priority(100);

    /// Default priority for ordinary user events.
    pub const USER_DEFAULT: Priority = Priority(10_000);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// A priority numerically below the lifecycle band but still internal;
    /// used by tests that need to assert strict ordering between two
    /// internal events.
    pub const fn lifecycle_offset(offset: u64) -> Self {
        Self(Self::LIFECYCLE.0 + offset)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A heap-allocated, owned event. Payloads must be `Send` so that the event
/// queue's push contract ("producers may be on any thread") is sound; this
/// does not require the *handlers* dispatching the payload to be `Send` —
/// only the data crossing the thread boundary.
pub struct Event {
    id: EventId,
    origin: ServiceId,
    priority: Priority,
    type_tag: TypeTag,
    payload: Box<dyn Any + Send>,
}

impl Event {
    pub(crate) fn new<T: Any + Send + 'static>(
        id: EventId,
        origin: ServiceId,
        priority: Priority,
        payload: T,
    ) -> Self {
        Self {
            id,
            origin,
            priority,
            type_tag: TypeTag::of::<T>(),
            payload: Box::new(payload),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Replace the id. Used by `EventQueue::push` implementations, which
    /// allocate the authoritative id at enqueue time rather than at
    /// construction time — a caller building an `Event` before it has a
    /// queue to push into has no id to give it yet.
    pub(crate) fn reassign_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn origin(&self) -> ServiceId {
        self.origin
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Borrow the payload as a concrete type, if it matches.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// Consume the event, recovering the concrete payload. Returns `self`
    /// unchanged (as `Err`) if the type does not match, mirroring
    /// `Box<dyn Any>::downcast`.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let Event {
            id,
            origin,
            priority,
            type_tag,
            payload,
        } = self;
        match payload.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(Self {
                id,
                origin,
                priority,
                type_tag,
                payload,
            }),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("priority", &self.priority)
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

/// Built-in event payload types (§6).
///
/// Every implementation must recognise these; the kernel's scheduler loop
/// dispatches them directly instead of consulting the user event-listener
/// table (§4.3 step 1d).
pub mod builtin {
    use crate::types::{ServiceId, TypeTag};

    /// Promise/continuation id. Coroutine frames are owned by the kernel in
    /// a promise-id-keyed map (§9) — `ContinuableEvent` carries only this
    /// id, not the frame itself, so the event payload stays `Send` even
    /// though suspended futures generally are not.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PromiseId(u64);

    impl PromiseId {
        pub const fn from_raw(raw: u64) -> Self {
            Self(raw)
        }
        pub const fn as_u64(self) -> u64 {
            self.0
        }
    }

    /// Registration id for handler-table entries. `Remove*Event` carries one
    /// of these rather than a direct table reference, so table mutation only
    /// ever happens from inside the scheduler loop (§4.2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegistrationId(u64);

    impl RegistrationId {
        pub const fn from_raw(raw: u64) -> Self {
            Self(raw)
        }
        pub const fn as_u64(self) -> u64 {
            self.0
        }
    }

    /// Register a newly created service in the registry (off the current
    /// iteration, at `Priority::INSERT_SERVICE`).
    #[derive(Debug, Clone, Copy)]
    pub struct InsertServiceEvent {
        pub service: ServiceId,
    }

    /// Ask dependency trackers for candidates satisfying `interface`.
    #[derive(Debug, Clone, Copy)]
    pub struct DependencyRequestEvent {
        pub requester: ServiceId,
        pub interface: TypeTag,
    }

    /// Tell dependency trackers that `requester` no longer needs candidates
    /// for `interface` (it is stopping or the dependency was satisfied).
    #[derive(Debug, Clone, Copy)]
    pub struct DependencyUndoRequestEvent {
        pub requester: ServiceId,
        pub interface: TypeTag,
    }

    /// `service` has become `Active` and can satisfy dependants.
    #[derive(Debug, Clone, Copy)]
    pub struct DependencyOnlineEvent {
        pub service: ServiceId,
    }

    /// `service` is leaving `Active`; dependants must drop it.
    #[derive(Debug, Clone, Copy)]
    pub struct DependencyOfflineEvent {
        pub service: ServiceId,
    }

    /// Entry point: begin starting `service`.
    #[derive(Debug, Clone, Copy)]
    pub struct StartServiceEvent {
        pub service: ServiceId,
    }

    /// Entry point: begin stopping `service`. `cause` is `Some` when the
    /// stop was triggered by a start failure or an upstream dependency
    /// error, for attribution in logs and in the error surfaced to awaiters.
    #[derive(Debug, Clone)]
    pub struct StopServiceEvent {
        pub service: ServiceId,
        pub cause: Option<String>,
    }

    /// Entry point: remove `service` from the registry entirely (only valid
    /// once it has reached `Installed`).
    #[derive(Debug, Clone, Copy)]
    pub struct RemoveServiceEvent {
        pub service: ServiceId,
    }

    /// Run a closure on the kernel thread. `Kernel` itself is a cheap
    /// `Rc`-backed handle (every field is `Rc<RefCell<_>>>`), so `&Kernel` is
    /// enough to push events, create services, or register handlers — no
    /// `&mut` is needed or, since the kernel may be cloned into other
    /// closures concurrently queued, possible.
    ///
    /// The closure itself sits behind a `RefCell` rather than being a plain
    /// field: dispatch only ever holds a shared `Rc<Event>` (so interceptors
    /// can still observe the event after it runs), so taking ownership of a
    /// `FnOnce` out of it needs interior mutability.
    ///
    /// `Event::new` requires its payload to be `Send`, since the queue
    /// accepts pushes from any thread, but this closure is routinely built
    /// around `Rc<RefCell<_>>` captures — the norm for this single-threaded
    /// kernel's own state. `RunFunctionEvent` is therefore asserted `Send`
    /// below rather than bounding the closure itself: sound only because the
    /// kernel's contract is that a `RunFunctionEvent` is dispatched (and so
    /// its closure touched) exclusively on the one thread that owns the
    /// `Kernel` it was built for, same as `ContinuationWaker` (§4.6).
    pub struct RunFunctionEvent {
        func: std::cell::RefCell<Option<Box<dyn FnOnce(&crate::kernel::Kernel)>>>,
    }

    unsafe impl Send for RunFunctionEvent {}

    impl RunFunctionEvent {
        pub fn new(func: impl FnOnce(&crate::kernel::Kernel) + 'static) -> Self {
            Self {
                func: std::cell::RefCell::new(Some(Box::new(func))),
            }
        }

        /// Take the closure so it can be run. Returns `None` if already
        /// taken — dispatch only ever does this once per event.
        pub fn take(&self) -> Option<Box<dyn FnOnce(&crate::kernel::Kernel)>> {
            self.func.borrow_mut().take()
        }
    }

    impl std::fmt::Debug for RunFunctionEvent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RunFunctionEvent").finish_non_exhaustive()
        }
    }

    /// Run an async closure on the kernel thread; the returned future is
    /// driven to completion on the kernel's `LocalSet` and so need not be
    /// `Send` itself. See `RunFunctionEvent` for why the closure sits behind
    /// a `RefCell` and why this type asserts `Send` rather than requiring it
    /// of the closure.
    pub struct RunFunctionEventAsync {
        #[allow(clippy::type_complexity)]
        func: std::cell::RefCell<
            Option<
                Box<dyn FnOnce(&crate::kernel::Kernel) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>>,
            >,
        >,
    }

    unsafe impl Send for RunFunctionEventAsync {}

    impl RunFunctionEventAsync {
        pub fn new<F>(func: impl FnOnce(&crate::kernel::Kernel) -> F + 'static) -> Self
        where
            F: std::future::Future<Output = ()> + 'static,
        {
            Self {
                func: std::cell::RefCell::new(Some(Box::new(move |kernel: &crate::kernel::Kernel| {
                    Box::pin(func(kernel)) as std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>
                }))),
            }
        }

        #[allow(clippy::type_complexity)]
        pub fn take(
            &self,
        ) -> Option<Box<dyn FnOnce(&crate::kernel::Kernel) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>>>
        {
            self.func.borrow_mut().take()
        }
    }

    impl std::fmt::Debug for RunFunctionEventAsync {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RunFunctionEventAsync").finish_non_exhaustive()
        }
    }

    /// Resume a suspended coroutine frame.
    #[derive(Debug, Clone, Copy)]
    pub struct ContinuableEvent {
        pub promise_id: PromiseId,
    }

    /// Start a routine that was registered before the kernel began running
    /// (e.g. a service's `start()` coroutine), at the same priority a normal
    /// continuation would use.
    #[derive(Debug, Clone, Copy)]
    pub struct ContinuableStartEvent {
        pub promise_id: PromiseId,
    }

    /// Deferred table mutation: drop a service's completion/error handlers.
    #[derive(Debug, Clone, Copy)]
    pub struct RemoveCompletionCallbacksEvent {
        pub registration: RegistrationId,
    }

    /// Deferred table mutation: drop an event listener registration.
    #[derive(Debug, Clone, Copy)]
    pub struct RemoveEventHandlerEvent {
        pub registration: RegistrationId,
    }

    /// Deferred table mutation: drop an interceptor registration.
    #[derive(Debug, Clone, Copy)]
    pub struct RemoveInterceptorEvent {
        pub registration: RegistrationId,
    }

    /// Deferred table mutation: drop a dependency tracker registration.
    #[derive(Debug, Clone, Copy)]
    pub struct RemoveTrackerEvent {
        pub registration: RegistrationId,
    }

    /// Begin shutdown (§4.3 step 2).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct QuitEvent;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_spec_band() {
        assert!(Priority::INSERT_SERVICE < Priority::LIFECYCLE);
        assert!(Priority::LIFECYCLE < Priority::USER_DEFAULT);
    }

    #[test]
    fn event_downcast_roundtrips() {
        let event = Event::new(EventId::from_raw(1), ServiceId::from_raw(1), Priority::USER_DEFAULT, 42u32);
        assert_eq!(event.downcast_ref::<u32>(), Some(&42));
        assert_eq!(event.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn event_downcast_rejects_wrong_type() {
        let event = Event::new(EventId::from_raw(1), ServiceId::from_raw(1), Priority::USER_DEFAULT, 42u32);
        let event = event.downcast::<String>().unwrap_err();
        assert_eq!(event.downcast_ref::<u32>(), Some(&42));
    }
}
