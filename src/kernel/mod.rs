//! The scheduler loop and public API (§4.3, §6).
//!
//! `Kernel` is a cheap, `Clone`-able handle: every field is `Rc`/`RefCell`, so
//! cloning it into a closure queued on the event queue is just a refcount
//! bump, and the clone observes exactly the same state. This is why
//! `RunFunctionEvent`'s closure takes `&Kernel` rather than `&mut Kernel` —
//! a `&mut` would forbid the handle being held in more than one place at
//! once, which is the whole point of handing it to user closures.

pub mod recovery;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use crate::coroutine::{
    ContinuationTable, ContinuationWaker, ScopeGuard, ServiceWait, ServiceWaiterTable, WaitOutcome, WaiterTable,
};
use crate::event::builtin::{
    ContinuableEvent, ContinuableStartEvent, DependencyOfflineEvent, DependencyOnlineEvent, DependencyRequestEvent,
    DependencyUndoRequestEvent, InsertServiceEvent, PromiseId, QuitEvent, RemoveCompletionCallbacksEvent,
    RemoveEventHandlerEvent, RemoveInterceptorEvent, RemoveServiceEvent, RemoveTrackerEvent, RunFunctionEvent,
    RunFunctionEventAsync, StartServiceEvent, StopServiceEvent,
};
use crate::event::{Event, Priority};
use crate::graph::DependencyGraph;
use crate::handlers::{DependencyTracker, EventListener, HandlerTables, Interceptor, RegistrationHandle};
use crate::lifecycle::{DependencyCallbacks, LifecycleManager, StopCause};
use crate::queue::{EventQueue, MultimapQueue};
use crate::registry::ServiceRegistry;
use crate::service::{DependencyDeclaration, Filter, PropertyMap, ServiceKind, ServiceState};
use crate::types::{Config, EventId, ServiceId, TypeTag};

/// A service's exposed interfaces: pairs of interface tag and the
/// type-erased value implementing it.
pub type ExposedInterfaces = Vec<(TypeTag, Rc<dyn Any>)>;

/// Builder for a constructor-injected service: invoked once, with every
/// required dependency already resolved, producing the interfaces the
/// service exposes from then on. Per §9, this replaces recovering the
/// dependency list from a constructor's signature — the builder closure
/// *is* the constructor.
type ConstructorBuilder = Box<dyn FnOnce(ExposedInterfaces) -> ExposedInterfaces>;

/// The service-kernel handle. Every field is shared, interior-mutable state;
/// cloning a `Kernel` is cheap and every clone sees the same scheduler.
#[derive(Clone)]
pub struct Kernel {
    inner: Rc<KernelInner>,
}

struct KernelInner {
    queue: Rc<dyn EventQueue>,
    config: Config,
    owner_thread: std::thread::ThreadId,
    registry: RefCell<ServiceRegistry>,
    graph: RefCell<DependencyGraph>,
    handlers: RefCell<HandlerTables>,
    waiters: Rc<WaiterTable>,
    /// §4.6 item 2's `wait_for_service` table: keyed by `(service, event
    /// type)`, notified at the same point the kernel pushes that built-in
    /// event for the service in question.
    service_waits: Rc<ServiceWaiterTable>,
    continuations: Rc<ContinuationTable>,
    /// Concrete values behind each `(service, interface)` pair a service
    /// currently exposes. The registry only tracks *which* services expose
    /// an interface (for candidate lookup); the data itself is type-erased
    /// `Rc<dyn Any>`, so it lives here instead.
    exposed_values: RefCell<HashMap<(ServiceId, TypeTag), Rc<dyn Any>>>,
    /// Constructor-injected services awaiting their dependencies, keyed by
    /// the service id the builder will run for once `Starting -> Injecting`
    /// is reachable.
    pending_builders: RefCell<HashMap<ServiceId, ConstructorBuilder>>,
    /// The `EventId` of the `StartServiceEvent` (or `StopServiceEvent`, if a
    /// stop preempted an in-flight start) that began a service's current
    /// attempt, so an async awaiter of that attempt can be resolved once it
    /// finishes — however many dispatch cycles later that turns out to be.
    starts: RefCell<HashMap<ServiceId, EventId>>,
    /// In-flight `push_prioritised_event_async(coalesce = true)` calls,
    /// keyed by (origin, event type). A second coalesced call for the same
    /// pair while the first is still unresolved piggybacks its waiter onto
    /// the same event id instead of pushing a second event (§4.6 item 1).
    coalesced_waits: RefCell<HashMap<(ServiceId, TypeTag), EventId>>,
}

impl Kernel {
    /// A fresh kernel using the default `MultimapQueue` and default config.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_queue(Rc::new(MultimapQueue::new()), config)
    }

    /// Construct with a caller-supplied queue — used to plug in the
    /// `io-uring`-backed ring queue instead of the default.
    pub fn with_queue(queue: Rc<dyn EventQueue>, config: Config) -> Self {
        Kernel {
            inner: Rc::new(KernelInner {
                queue,
                config,
                owner_thread: std::thread::current().id(),
                registry: RefCell::new(ServiceRegistry::new()),
                graph: RefCell::new(DependencyGraph::new()),
                handlers: RefCell::new(HandlerTables::new()),
                waiters: Rc::new(WaiterTable::new()),
                service_waits: Rc::new(ServiceWaiterTable::new()),
                continuations: Rc::new(ContinuationTable::new()),
                exposed_values: RefCell::new(HashMap::new()),
                pending_builders: RefCell::new(HashMap::new()),
                starts: RefCell::new(HashMap::new()),
                coalesced_waits: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// §7's hardened-mode check: abort rather than continue with state that
    /// may now be torn by a cross-thread touch.
    fn assert_owning_thread(&self) {
        if std::thread::current().id() != self.inner.owner_thread {
            tracing::error!("kernel touched from a non-owning thread; aborting");
            std::process::abort();
        }
    }

    // ---- service creation -----------------------------------------------

    /// Register an `Advanced` service: its exposed interfaces and dependency
    /// callbacks are supplied up front, since an `Advanced` service manages
    /// its own dependency wiring rather than waiting for a single
    /// all-at-once constructor call.
    pub fn create_advanced_service(
        &self,
        priority: i32,
        properties: PropertyMap,
        dependencies: Vec<DependencyDeclaration>,
        exposes: ExposedInterfaces,
        callbacks: DependencyCallbacks,
    ) -> ServiceId {
        let tags: Vec<TypeTag> = exposes.iter().map(|(tag, _)| *tag).collect();
        let id = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.insert(ServiceKind::Advanced, dependencies, tags);
            let manager = registry.get_mut(id).expect("just inserted");
            manager.descriptor_mut().priority = priority;
            manager.descriptor_mut().properties = properties;
            manager.set_callbacks(callbacks);
            id
        };
        {
            let mut values = self.inner.exposed_values.borrow_mut();
            for (tag, value) in exposes {
                values.insert((id, tag), value);
            }
        }
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            id,
            Priority::INSERT_SERVICE,
            InsertServiceEvent { service: id },
        ));
        id
    }

    /// Register a `ConstructorInjected` service: `build` runs exactly once,
    /// after every required dependency is already `Active`, and its return
    /// value becomes the service's exposed interfaces.
    pub fn create_constructor_injected_service<F>(
        &self,
        priority: i32,
        properties: PropertyMap,
        dependencies: Vec<DependencyDeclaration>,
        build: F,
    ) -> ServiceId
    where
        F: FnOnce(ExposedInterfaces) -> ExposedInterfaces + 'static,
    {
        let id = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.insert(ServiceKind::ConstructorInjected, dependencies, vec![]);
            let manager = registry.get_mut(id).expect("just inserted");
            manager.descriptor_mut().priority = priority;
            manager.descriptor_mut().properties = properties;
            id
        };
        self.inner.pending_builders.borrow_mut().insert(id, Box::new(build));
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            id,
            Priority::INSERT_SERVICE,
            InsertServiceEvent { service: id },
        ));
        id
    }

    /// Begin starting `service`. Returns the `EventId` of the
    /// `StartServiceEvent`, which resolves via the waiter table once the
    /// attempt succeeds or fails — see `start_service_async`.
    pub fn start_service(&self, service: ServiceId) -> EventId {
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            service,
            Priority::LIFECYCLE,
            StartServiceEvent { service },
        ))
    }

    /// Like `start_service`, but returns a future resolving once the start
    /// attempt finishes, one way or the other.
    pub fn start_service_async(&self, service: ServiceId) -> impl Future<Output = WaitOutcome> {
        let event_id = self.start_service(service);
        self.inner.waiters.wait_owned(event_id)
    }

    /// §4.6 item 2, §6: suspend until `service` reaches the lifecycle
    /// transition that would emit an `E` event — e.g.
    /// `wait_for_service::<DependencyOnlineEvent>(id)` resolves once `id`
    /// becomes `Active`. Unlike `start_service_async`, this does not itself
    /// drive any transition; it only observes one that some other caller
    /// triggers.
    pub fn wait_for_service<E: Any>(&self, service: ServiceId) -> ServiceWait {
        self.inner.service_waits.wait(service, TypeTag::of::<E>())
    }

    pub fn stop_service(&self, service: ServiceId, cause: Option<String>) {
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            service,
            Priority::LIFECYCLE,
            StopServiceEvent { service, cause },
        ));
    }

    pub fn remove_service(&self, service: ServiceId) {
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            service,
            Priority::LIFECYCLE,
            RemoveServiceEvent { service },
        ));
    }

    pub fn service_state(&self, service: ServiceId) -> Option<ServiceState> {
        self.inner.registry.borrow().get(service).map(LifecycleManager::state)
    }

    // ---- event push / await ----------------------------------------------

    pub fn push<T: Any + Send + 'static>(&self, origin: ServiceId, priority: Priority, payload: T) -> EventId {
        self.inner.queue.push(Event::new(EventId::from_raw(0), origin, priority, payload))
    }

    pub fn push_event<T: Any + Send + 'static>(&self, origin: ServiceId, payload: T) -> EventId {
        self.push(origin, Priority::USER_DEFAULT, payload)
    }

    /// Push an event and return a future resolving once some in-kernel
    /// caller resolves its id in the waiter table — used by coroutines that
    /// push a request event and then suspend until whatever services it
    /// resolves the wait.
    ///
    /// When `coalesce` is true and this `(origin, T)` pair already has an
    /// unresolved call in flight, no new event is pushed — the returned
    /// future instead piggybacks onto the existing one's waiter entry, so
    /// both callers observe the same single dispatch and outcome (§4.6 item
    /// 1). A non-coalesced call, or the first of a coalesced pair, always
    /// pushes.
    pub fn push_prioritised_event_async<T: Any + Send + 'static>(
        &self,
        origin: ServiceId,
        priority: Priority,
        payload: T,
        coalesce: bool,
    ) -> impl Future<Output = WaitOutcome> {
        let type_tag = TypeTag::of::<T>();
        if coalesce {
            if let Some(&event_id) = self.inner.coalesced_waits.borrow().get(&(origin, type_tag)) {
                return self.inner.waiters.wait_owned(event_id);
            }
        }
        let event_id = self.push(origin, priority, payload);
        if coalesce {
            self.inner.coalesced_waits.borrow_mut().insert((origin, type_tag), event_id);
        }
        self.inner.waiters.wait_owned(event_id)
    }

    /// Resolve a pending waiter directly — for use by user-registered event
    /// listeners that service a `push_prioritised_event_async` request. Also
    /// clears any `coalesce = true` entry keyed to this event id, so the
    /// next call for that `(origin, T)` pair pushes a fresh event rather
    /// than piggybacking on one that has already settled.
    pub fn resolve(&self, event_id: EventId, outcome: WaitOutcome) {
        self.inner.waiters.resolve(event_id, outcome);
        self.inner.coalesced_waits.borrow_mut().retain(|_, id| *id != event_id);
    }

    pub fn quit(&self) {
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            ServiceId::from_raw(0),
            Priority::LIFECYCLE,
            QuitEvent,
        ));
    }

    // ---- registration -----------------------------------------------------

    pub fn register_event_handler<L>(&self, origin: ServiceId, event_type: TypeTag, listener: L) -> RegistrationHandle
    where
        L: EventListener + 'static,
    {
        let registration = self.inner.handlers.borrow_mut().add_event_listener(event_type, Rc::new(listener));
        RegistrationHandle::new_event_listener(self.inner.queue.clone(), origin, registration, event_type)
    }

    pub fn register_dependency_tracker<T>(&self, origin: ServiceId, interface: TypeTag, tracker: T) -> RegistrationHandle
    where
        T: DependencyTracker + 'static,
    {
        let registration = self.inner.handlers.borrow_mut().add_tracker(interface, Rc::new(tracker));
        RegistrationHandle::new_tracker(self.inner.queue.clone(), origin, registration, interface)
    }

    pub fn register_event_interceptor<I>(&self, origin: ServiceId, interceptor: I) -> RegistrationHandle
    where
        I: Interceptor + 'static,
    {
        let registration = self.inner.handlers.borrow_mut().add_interceptor(Rc::new(interceptor));
        RegistrationHandle::new_interceptor(self.inner.queue.clone(), origin, registration)
    }

    /// Register completion/error handlers for `service`. The service itself
    /// is used as the handle's removal origin — there is no separate
    /// "registrant" identity for this kind of registration.
    pub fn register_completion_handlers<C, E>(&self, service: ServiceId, on_complete: C, on_error: E) -> RegistrationHandle
    where
        C: Fn(ServiceId) + 'static,
        E: Fn(ServiceId, &crate::types::Error) + 'static,
    {
        let registration = self
            .inner
            .handlers
            .borrow_mut()
            .add_completion_handlers(service, Rc::new(on_complete), Rc::new(on_error));
        RegistrationHandle::new_completion_handlers(self.inner.queue.clone(), service, registration, service)
    }

    // ---- coroutine spawn ---------------------------------------------------

    /// Spawn an `async` block to run under `scope`'s execution scope, driven
    /// forward by `ContinuableStartEvent`/`ContinuableEvent` dispatch rather
    /// than a bare `tokio::task::spawn_local` — so a suspended frame always
    /// resumes at the kernel-internal priority band, not at whatever
    /// priority its waker happened to fire from.
    pub fn spawn<F>(&self, scope: ServiceId, future: F) -> PromiseId
    where
        F: Future<Output = ()> + 'static,
    {
        let promise_id = self.inner.continuations.next_promise_id();
        self.inner.continuations.store(promise_id, scope, Box::pin(future));
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            scope,
            Priority::lifecycle_offset(1),
            ContinuableStartEvent { promise_id },
        ));
        promise_id
    }

    /// Poll the frame stored under `promise_id` once. If it's still
    /// `Pending`, put it back; if `Ready`, it's consumed.
    fn poll_continuation(&self, promise_id: PromiseId) {
        let Some((scope, mut future)) = self.inner.continuations.take(promise_id) else {
            tracing::debug!(promise = promise_id.as_u64(), "continuation already consumed, dropping resume");
            return;
        };
        let _scope_guard = ScopeGuard::enter(scope);
        let waker = ContinuationWaker::new(self.inner.queue.clone(), scope, promise_id).into_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(()) => {}
            std::task::Poll::Pending => {
                self.inner.continuations.store(promise_id, scope, future);
            }
        }
    }

    // ---- internal dependency wiring ---------------------------------------

    fn exposed_value(&self, service: ServiceId, tag: TypeTag) -> Option<Rc<dyn Any>> {
        self.inner.exposed_values.borrow().get(&(service, tag)).cloned()
    }

    /// Candidates for `interface` that satisfy `filter`, restricted to
    /// services already `Active` (§4.7's `get_started`).
    fn candidates(&self, interface: TypeTag, filter: Option<&Filter>) -> Vec<ServiceId> {
        let registry = self.inner.registry.borrow();
        registry
            .get_started(interface)
            .into_iter()
            .filter(|&candidate| match (filter, registry.get(candidate)) {
                (Some(filter), Some(manager)) => filter.matches(candidate, &manager.descriptor().properties),
                _ => true,
            })
            .collect()
    }

    /// Try to advance `service` through `Starting -> Injecting -> Active`,
    /// wiring any dependency candidates that are already available. Safe to
    /// call repeatedly — a service not yet ready to progress just stays
    /// where it is.
    fn attempt_start(&self, service: ServiceId) {
        let state = match self.inner.registry.borrow().get(service).map(LifecycleManager::state) {
            Some(state) => state,
            None => return,
        };

        if state == ServiceState::Installed {
            let started = matches!(
                self.inner.registry.borrow_mut().get_mut(service).map(|m| m.start()),
                Some(Ok(()))
            );
            if !started {
                return;
            }

            let declarations: Vec<TypeTag> = self
                .inner
                .registry
                .borrow()
                .get(service)
                .map(|m| m.dependencies().iter().map(|d| d.interface).collect())
                .unwrap_or_default();

            for interface in declarations {
                self.inner.queue.push(Event::new(
                    EventId::from_raw(0),
                    service,
                    Priority::LIFECYCLE,
                    DependencyRequestEvent { requester: service, interface },
                ));
            }
        }

        let currently_starting =
            self.inner.registry.borrow().get(service).map(LifecycleManager::state) == Some(ServiceState::Starting);
        if !currently_starting {
            return;
        }

        self.wire_available_dependencies(service);

        let ready = self
            .inner
            .registry
            .borrow()
            .get(service)
            .map(LifecycleManager::required_dependencies_satisfied)
            .unwrap_or(false);
        if !ready {
            return;
        }

        let began_injecting = matches!(
            self.inner.registry.borrow_mut().get_mut(service).map(|m| m.begin_injecting()),
            Some(Ok(()))
        );
        if !began_injecting {
            return;
        }

        let exposes = self.run_constructor_if_pending(service);
        let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.complete_injecting());

        if !exposes.is_empty() {
            let tags: Vec<TypeTag> = exposes.iter().map(|(tag, _)| *tag).collect();
            self.inner.registry.borrow_mut().add_exposed(service, &tags);
            let mut values = self.inner.exposed_values.borrow_mut();
            for (tag, value) in exposes {
                values.insert((service, tag), value);
            }
        }

        #[cfg(debug_assertions)]
        {
            let active: std::collections::HashSet<ServiceId> = self
                .inner
                .registry
                .borrow()
                .ids()
                .filter(|&id| self.inner.registry.borrow().get(id).map(LifecycleManager::state) == Some(ServiceState::Active))
                .collect();
            self.inner.graph.borrow().assert_dag_among(&active);
        }

        tracing::info!(%service, "service active");
        self.inner.queue.push(Event::new(
            EventId::from_raw(0),
            service,
            Priority::LIFECYCLE,
            DependencyOnlineEvent { service },
        ));
        self.inner.service_waits.notify(service, TypeTag::of::<DependencyOnlineEvent>());

        if let Some(event_id) = self.inner.starts.borrow_mut().remove(&service) {
            self.inner.waiters.resolve(event_id, WaitOutcome::Completed);
        }

        // A newly active service may satisfy other services still waiting
        // to start; re-probe everyone currently in `Starting` (a simpler,
        // if coarser, notification scheme than per-interface wakeups).
        let starting: Vec<ServiceId> = self
            .inner
            .registry
            .borrow()
            .ids()
            .filter(|&id| self.inner.registry.borrow().get(id).map(LifecycleManager::state) == Some(ServiceState::Starting))
            .collect();
        for waiting in starting {
            if waiting != service {
                self.attempt_start(waiting);
            }
        }
    }

    fn wire_available_dependencies(&self, service: ServiceId) {
        let declarations: Vec<(TypeTag, Option<Filter>)> = self
            .inner
            .registry
            .borrow()
            .get(service)
            .map(|m| m.dependencies().iter().map(|d| (d.interface, d.filter.clone())).collect())
            .unwrap_or_default();

        for (interface, filter) in declarations {
            let already_wired: std::collections::HashSet<ServiceId> =
                self.inner.graph.borrow().dependencies_of(service).collect();

            for candidate in self.candidates(interface, filter.as_ref()) {
                if candidate == service || already_wired.contains(&candidate) {
                    continue;
                }
                let Some(value) = self.exposed_value(candidate, interface) else {
                    continue;
                };
                self.inner.graph.borrow_mut().add_edge(service, candidate);
                let result = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.add_dependency(interface, value));
                if let Some(Err(err)) = result {
                    tracing::warn!(%service, %err, "add_dependency callback failed, returning service toward Installed");
                    let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.fail_start(err.to_string()));
                    self.finish_stop(service, Some(err.to_string()));
                    return;
                }
            }
        }
    }

    fn run_constructor_if_pending(&self, service: ServiceId) -> ExposedInterfaces {
        let Some(build) = self.inner.pending_builders.borrow_mut().remove(&service) else {
            return Vec::new();
        };
        let injected: ExposedInterfaces = self
            .inner
            .registry
            .borrow()
            .get(service)
            .map(|m| m.interfaces().tags().filter_map(|tag| m.interfaces().get_dyn(tag).map(|value| (tag, value))).collect())
            .unwrap_or_default();
        build(injected)
    }

    /// A service just left `Active`; tell its dependants and drop the edges.
    fn offline_service(&self, service: ServiceId) {
        let tags: Vec<TypeTag> = self.inner.registry.borrow().exposed_tags(service).to_vec();
        let dependants: Vec<ServiceId> = self.inner.graph.borrow().dependants_of(service).collect();

        for dependant in dependants {
            let state = self.inner.registry.borrow().get(dependant).map(LifecycleManager::state);
            // Open-question resolution: a dependant already past the state
            // where this transition applies gets the event dropped as a
            // no-op, logged at debug rather than forced through an invalid
            // transition.
            let Some(state) = state else {
                tracing::debug!(%dependant, "dependency offline for a service no longer registered, dropping");
                continue;
            };
            if !matches!(state, ServiceState::Active | ServiceState::Starting | ServiceState::Injecting) {
                tracing::debug!(%dependant, ?state, "dependency offline does not apply in this state, dropping");
                continue;
            }

            let mut required_lost = false;
            for &tag in &tags {
                let (has_declaration, required) = self
                    .inner
                    .registry
                    .borrow()
                    .get(dependant)
                    .map(|m| {
                        let has = m.dependencies().iter().any(|d| d.interface == tag);
                        let req = m.dependencies().iter().any(|d| d.interface == tag && d.required);
                        (has, req)
                    })
                    .unwrap_or((false, false));
                if !has_declaration {
                    continue;
                }

                let mut registry = self.inner.registry.borrow_mut();
                let Some(manager) = registry.get_mut(dependant) else { continue };
                if manager.remove_dependency(tag).is_err() {
                    continue;
                }
                if required && !manager.required_dependencies_satisfied() {
                    required_lost = true;
                }
            }
            self.inner.graph.borrow_mut().remove_edge(dependant, service);

            if required_lost && state == ServiceState::Active {
                self.stop_service(dependant, Some(format!("required dependency {service} went offline")));
            }
        }
    }

    /// §4.3 step 2: on quit, push a `StopServiceEvent` for every service not
    /// already `Installed`/`Uninstalled`, in descending `ServiceId` order —
    /// since dependants are ordinarily created after the dependencies they
    /// declare, stopping newest-first stops consumers before providers in
    /// the common case without needing a separate recorded start order.
    fn stop_all_remaining_services(&self) {
        let mut remaining: Vec<ServiceId> = self
            .inner
            .registry
            .borrow()
            .ids()
            .filter(|&id| {
                !matches!(
                    self.inner.registry.borrow().get(id).map(LifecycleManager::state),
                    Some(ServiceState::Installed) | None
                )
            })
            .collect();
        remaining.sort_by_key(|id| std::cmp::Reverse(id.as_u64()));
        for service in remaining {
            self.stop_service(service, None);
        }
    }

    /// Move a service out of `Active` (or abandon a `Starting`/`Injecting`
    /// attempt) and synchronously finish stopping it — there is no
    /// user-supplied async "stop" coroutine modeled here, so `Uninjecting`
    /// and `Stopping` are transient, same-dispatch states rather than ones
    /// that wait on further events.
    fn stop_service_internal(&self, service: ServiceId, cause: Option<String>) {
        let state = match self.inner.registry.borrow().get(service).map(LifecycleManager::state) {
            Some(state) => state,
            None => return,
        };

        match state {
            ServiceState::Active => {
                let stop_cause = cause.clone().map(StopCause::StartFailed).unwrap_or(StopCause::Requested);
                let began = matches!(
                    self.inner.registry.borrow_mut().get_mut(service).map(|m| m.begin_uninjecting(stop_cause)),
                    Some(Ok(()))
                );
                if !began {
                    return;
                }
                self.inner.queue.push(Event::new(
                    EventId::from_raw(0),
                    service,
                    Priority::LIFECYCLE,
                    DependencyOfflineEvent { service },
                ));
                self.inner.service_waits.notify(service, TypeTag::of::<DependencyOfflineEvent>());
                self.offline_service(service);
                let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.complete_uninjecting());
                self.finish_stop(service, cause);
            }
            ServiceState::Starting | ServiceState::Injecting => {
                let reason = cause.unwrap_or_else(|| "stop requested before service became active".to_string());
                let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.fail_start(reason.clone()));
                self.finish_stop(service, Some(reason));
            }
            _ => {
                tracing::debug!(%service, ?state, "stop requested in a state that does not apply, dropping");
            }
        }
    }

    /// Finish a stop: land on `Installed` (if `Stopping` was reached),
    /// abandon any suspended coroutine frames scoped to the service, notify
    /// completion handlers, and resolve any pending start-wait.
    fn finish_stop(&self, service: ServiceId, cause: Option<String>) {
        let state = self.inner.registry.borrow().get(service).map(LifecycleManager::state);
        if state == Some(ServiceState::Stopping) {
            let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.complete_stop());
        }
        self.inner.continuations.drop_scope(service);

        if let Some(event_id) = self.inner.starts.borrow_mut().remove(&service) {
            let outcome = match &cause {
                Some(reason) => WaitOutcome::Failed(reason.clone()),
                None => WaitOutcome::Completed,
            };
            self.inner.waiters.resolve(event_id, outcome);
        }

        let handlers: Vec<_> = self.inner.handlers.borrow().completion_handlers_for(service).cloned().collect();
        for (on_complete, on_error) in handlers {
            match &cause {
                Some(reason) => on_error(service, &crate::types::Error::internal(reason.clone())),
                None => on_complete(service),
            }
        }
    }

    fn remove_service_internal(&self, service: ServiceId) {
        let state = self.inner.registry.borrow().get(service).map(LifecycleManager::state);
        let Some(state) = state else {
            return;
        };
        if state != ServiceState::Installed {
            tracing::debug!(%service, ?state, "remove requested while not fully stopped, dropping");
            return;
        }
        let _ = self.inner.registry.borrow_mut().get_mut(service).map(|m| m.uninstall());
        self.inner.registry.borrow_mut().remove(service);
        self.inner.graph.borrow_mut().remove_service(service);
        self.inner.continuations.drop_scope(service);
        self.inner.exposed_values.borrow_mut().retain(|(owner, _), _| *owner != service);
        self.inner.pending_builders.borrow_mut().remove(&service);
    }

    // ---- dispatch -----------------------------------------------------------

    /// Run every registered interceptor's `pre`, the built-in or
    /// user-registered handling for `event`, then every interceptor's `post`
    /// — §4.3 steps (c)-(e).
    async fn dispatch_event(&self, event: Event) {
        self.assert_owning_thread();
        let event = Rc::new(event);

        let interceptors: Vec<Rc<dyn Interceptor>> = self.inner.handlers.borrow().interceptors().cloned().collect();

        let mut vetoed = false;
        for interceptor in &interceptors {
            if !interceptor.pre(&event) {
                vetoed = true;
            }
        }

        let dispatched = if vetoed { false } else { self.dispatch_builtin_or_user(&event).await };

        for interceptor in &interceptors {
            interceptor.post(&event, dispatched);
        }
    }

    async fn dispatch_builtin_or_user(&self, event: &Rc<Event>) -> bool {
        let scope = event.origin();
        let _scope_guard = ScopeGuard::enter(scope);

        if let Some(&InsertServiceEvent { service }) = event.downcast_ref::<InsertServiceEvent>() {
            tracing::debug!(%service, "service inserted");
            self.inner.service_waits.notify(service, TypeTag::of::<InsertServiceEvent>());
            return true;
        }
        if let Some(&StartServiceEvent { service }) = event.downcast_ref::<StartServiceEvent>() {
            self.inner.starts.borrow_mut().entry(service).or_insert_with(|| event.id());
            self.attempt_start(service);
            return true;
        }
        if let Some(payload) = event.downcast_ref::<StopServiceEvent>() {
            let StopServiceEvent { service, cause } = payload.clone();
            self.inner.starts.borrow_mut().entry(service).or_insert_with(|| event.id());
            self.stop_service_internal(service, cause);
            return true;
        }
        if let Some(&RemoveServiceEvent { service }) = event.downcast_ref::<RemoveServiceEvent>() {
            self.remove_service_internal(service);
            return true;
        }
        if let Some(&DependencyRequestEvent { requester, interface }) = event.downcast_ref::<DependencyRequestEvent>() {
            let trackers: Vec<_> = self.inner.handlers.borrow().trackers_for(interface).cloned().collect();
            for tracker in trackers {
                tracker.on_request(requester, interface);
            }
            return true;
        }
        if let Some(&DependencyUndoRequestEvent { requester, interface }) = event.downcast_ref::<DependencyUndoRequestEvent>() {
            let trackers: Vec<_> = self.inner.handlers.borrow().trackers_for(interface).cloned().collect();
            for tracker in trackers {
                tracker.on_undo_request(requester, interface);
            }
            return true;
        }
        if event.downcast_ref::<DependencyOnlineEvent>().is_some() {
            // Already acted on synchronously inside `attempt_start`; this
            // event's only remaining role is to notify user listeners,
            // handled by the generic dispatch below.
        }
        if event.downcast_ref::<DependencyOfflineEvent>().is_some() {
            // Already acted on synchronously inside `offline_service`.
        }
        if let Some(&ContinuableEvent { promise_id }) = event.downcast_ref::<ContinuableEvent>() {
            self.poll_continuation(promise_id);
            return true;
        }
        if let Some(&ContinuableStartEvent { promise_id }) = event.downcast_ref::<ContinuableStartEvent>() {
            self.poll_continuation(promise_id);
            return true;
        }
        if let Some(&RemoveEventHandlerEvent { registration }) = event.downcast_ref::<RemoveEventHandlerEvent>() {
            self.inner.handlers.borrow_mut().remove_event_listener_by_id(registration);
            return true;
        }
        if let Some(&RemoveTrackerEvent { registration }) = event.downcast_ref::<RemoveTrackerEvent>() {
            self.inner.handlers.borrow_mut().remove_tracker_by_id(registration);
            return true;
        }
        if let Some(&RemoveInterceptorEvent { registration }) = event.downcast_ref::<RemoveInterceptorEvent>() {
            self.inner.handlers.borrow_mut().remove_interceptor(registration);
            return true;
        }
        if let Some(&RemoveCompletionCallbacksEvent { registration }) = event.downcast_ref::<RemoveCompletionCallbacksEvent>() {
            self.inner.handlers.borrow_mut().remove_completion_handlers_by_id(registration);
            return true;
        }
        if event.downcast_ref::<QuitEvent>().is_some() {
            tracing::info!("quit requested, beginning shutdown");
            self.inner.queue.quit();
            self.stop_all_remaining_services();
            return true;
        }
        if let Some(run) = event.downcast_ref::<RunFunctionEvent>() {
            if let Some(func) = run.take() {
                func(self);
            }
            return true;
        }
        if let Some(run) = event.downcast_ref::<RunFunctionEventAsync>() {
            if let Some(func) = run.take() {
                let future = func(self);
                self.spawn(scope, future);
            }
            return true;
        }

        let listeners: Vec<_> = self.inner.handlers.borrow().listeners_for(event.type_tag()).cloned().collect();
        if listeners.is_empty() {
            tracing::debug!(type_tag = %event.type_tag(), "no listener for event");
            return false;
        }
        for listener in listeners {
            listener.call(Rc::clone(event)).await;
        }
        true
    }

    // ---- scheduler loop -----------------------------------------------------

    /// Run the scheduler loop to completion. Builds a `tokio::task::LocalSet`
    /// so handler futures and coroutine continuations need not be `Send`
    /// (§4.3). Returns once `quit()` has been called and the drain phase
    /// (bounded by `config.scheduler.quit_timeout`) finishes.
    pub async fn start(self, capture_sigint: bool) {
        let local = tokio::task::LocalSet::new();
        local.run_until(self.run_loop(capture_sigint)).await;
    }

    /// Dispatch every event currently queued (including ones pushed by
    /// dispatch itself, e.g. a `ContinuableEvent` scheduling its own
    /// resumption) and return once the queue reports empty.
    ///
    /// This does not start the full scheduler loop (`start`) and does not
    /// honor `quit()` specially — it is the single-step primitive tests use
    /// to drive a kernel deterministically between assertions, without
    /// racing a backgrounded loop task for access to kernel state.
    pub async fn run_until_idle(&self) {
        while let Some(event) = self.inner.queue.pop_highest_priority() {
            self.dispatch_event(event).await;
        }
    }

    async fn run_loop(&self, capture_sigint: bool) {
        loop {
            if let Some(event) = self.inner.queue.pop_highest_priority() {
                self.dispatch_event(event).await;
                continue;
            }
            if self.inner.queue.is_quitting() {
                break;
            }

            let poll_timeout = self.inner.config.scheduler.poll_timeout;
            if capture_sigint {
                tokio::select! {
                    _ = tokio::time::timeout(poll_timeout, self.inner.queue.notified()) => {}
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_ok() {
                            tracing::info!("ctrl-c received, quitting");
                            self.inner.queue.quit();
                        }
                    }
                }
            } else {
                let _ = tokio::time::timeout(poll_timeout, self.inner.queue.notified()).await;
            }
        }
        self.drain_on_quit().await;
    }

    /// §4.3 step 3: keep dispatching until the queue empties or
    /// `quit_timeout` elapses, then force-release anything left outstanding
    /// with `WaitOutcome::Quitting`.
    async fn drain_on_quit(&self) {
        let deadline = tokio::time::Instant::now() + self.inner.config.scheduler.quit_timeout;
        while tokio::time::Instant::now() < deadline {
            match self.inner.queue.pop_highest_priority() {
                Some(event) => self.dispatch_event(event).await,
                None => break,
            }
        }
        self.inner.waiters.resolve_all_pending(WaitOutcome::Quitting);
        // Resolving a waiter wakes its continuation's `ContinuationWaker`,
        // which re-pushes a `ContinuableEvent` rather than resuming the
        // future directly (§4.6) — drain those now so a coroutine actually
        // observes the `Quitting` outcome and runs to completion before its
        // frame is discarded below, instead of being dropped mid-poll.
        while let Some(event) = self.inner.queue.pop_highest_priority() {
            self.dispatch_event(event).await;
        }
        self.inner.continuations.clear();
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("services", &self.inner.registry.borrow().len())
            .field("quitting", &self.inner.queue.is_quitting())
            .finish()
    }
}
