//! Handler tables and the `RegistrationHandle` RAII type (§4.2).
//!
//! Four tables live here: event listeners, completion/error handlers,
//! interceptors, and dependency trackers, all keyed by `TypeTag` (or
//! `(ServiceId, TypeTag)` for completion handlers) in `HashMap`s for `O(1)`
//! average lookup. Table mutation only ever happens from inside the
//! scheduler loop, while dispatching a `Remove*Event` — a `RegistrationHandle`
//! going out of scope pushes that event rather than touching the table
//! directly, so no iteration over a table ever observes a half-removed
//! entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::event::builtin::RegistrationId;
use crate::event::Event;
use crate::queue::EventQueue;
use crate::types::{ServiceId, TypeTag};

/// An event listener: given a shared `Event`, returns a future to drive to
/// completion on the kernel's `LocalSet`. Object-safe so listeners can be
/// stored as trait objects; a blanket impl covers ordinary closures. The
/// event is `Rc`-shared rather than owned because more than one listener
/// may be registered for the same type tag and none of them owns the only
/// copy.
pub trait EventListener {
    fn call(&self, event: Rc<Event>) -> Pin<Box<dyn Future<Output = ()>>>;
}

impl<F, Fut> EventListener for F
where
    F: Fn(Rc<Event>) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    fn call(&self, event: Rc<Event>) -> Pin<Box<dyn Future<Output = ()>>> {
        Box::pin((self)(event))
    }
}

/// A dependency tracker is asked, for a given interface tag, whether a
/// candidate service satisfies a requester's declaration. Trackers are
/// consulted in response to a `DependencyRequestEvent`.
pub trait DependencyTracker {
    fn on_request(&self, requester: ServiceId, interface: TypeTag);
    fn on_undo_request(&self, requester: ServiceId, interface: TypeTag);
}

impl<F, G> DependencyTracker for (F, G)
where
    F: Fn(ServiceId, TypeTag),
    G: Fn(ServiceId, TypeTag),
{
    fn on_request(&self, requester: ServiceId, interface: TypeTag) {
        (self.0)(requester, interface)
    }
    fn on_undo_request(&self, requester: ServiceId, interface: TypeTag) {
        (self.1)(requester, interface)
    }
}

/// An interceptor observes every event, before (`pre`) or after (`post`)
/// normal dispatch. `pre` may veto dispatch by returning `false`; `post`
/// always runs afterward (even on veto) and is told whether dispatch
/// actually happened, per §4.3 steps (c) and (e).
pub trait Interceptor {
    fn pre(&self, event: &Event) -> bool;
    fn post(&self, event: &Event, dispatched: bool);
}

type RcListener = Rc<dyn EventListener>;
type RcTracker = Rc<dyn DependencyTracker>;
type RcInterceptor = Rc<dyn Interceptor>;
type RcCompletion = Rc<dyn Fn(ServiceId)>;
type RcError = Rc<dyn Fn(ServiceId, &crate::types::Error)>;

/// The four handler tables, owned by the `Kernel`.
#[derive(Default)]
pub struct HandlerTables {
    next_registration: u64,
    event_listeners: HashMap<TypeTag, HashMap<RegistrationId, RcListener>>,
    trackers: HashMap<TypeTag, HashMap<RegistrationId, RcTracker>>,
    interceptors: HashMap<RegistrationId, RcInterceptor>,
    completion_handlers: HashMap<(ServiceId, RegistrationId), (RcCompletion, RcError)>,
}

impl HandlerTables {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> RegistrationId {
        self.next_registration += 1;
        RegistrationId::from_raw(self.next_registration)
    }

    pub fn add_event_listener(&mut self, event_type: TypeTag, listener: RcListener) -> RegistrationId {
        let id = self.next_id();
        self.event_listeners.entry(event_type).or_default().insert(id, listener);
        id
    }

    pub fn remove_event_listener(&mut self, event_type: TypeTag, id: RegistrationId) {
        if let Some(table) = self.event_listeners.get_mut(&event_type) {
            table.remove(&id);
        }
    }

    /// Remove a listener registration without knowing which event type it
    /// was filed under — `Remove*Event` carries only the `RegistrationId`
    /// (§4.2), so dispatch scans every bucket. Registration churn is low
    /// enough that this is cheaper than threading the type tag through the
    /// event payload.
    pub fn remove_event_listener_by_id(&mut self, id: RegistrationId) {
        for table in self.event_listeners.values_mut() {
            table.remove(&id);
        }
    }

    pub fn listeners_for(&self, event_type: TypeTag) -> impl Iterator<Item = &RcListener> {
        self.event_listeners.get(&event_type).into_iter().flat_map(|table| table.values())
    }

    pub fn add_tracker(&mut self, interface: TypeTag, tracker: RcTracker) -> RegistrationId {
        let id = self.next_id();
        self.trackers.entry(interface).or_default().insert(id, tracker);
        id
    }

    pub fn remove_tracker(&mut self, interface: TypeTag, id: RegistrationId) {
        if let Some(table) = self.trackers.get_mut(&interface) {
            table.remove(&id);
        }
    }

    /// See `remove_event_listener_by_id`.
    pub fn remove_tracker_by_id(&mut self, id: RegistrationId) {
        for table in self.trackers.values_mut() {
            table.remove(&id);
        }
    }

    pub fn trackers_for(&self, interface: TypeTag) -> impl Iterator<Item = &RcTracker> {
        self.trackers.get(&interface).into_iter().flat_map(|table| table.values())
    }

    pub fn add_interceptor(&mut self, interceptor: RcInterceptor) -> RegistrationId {
        let id = self.next_id();
        self.interceptors.insert(id, interceptor);
        id
    }

    pub fn remove_interceptor(&mut self, id: RegistrationId) {
        self.interceptors.remove(&id);
    }

    pub fn interceptors(&self) -> impl Iterator<Item = &RcInterceptor> {
        self.interceptors.values()
    }

    pub fn add_completion_handlers(
        &mut self,
        service: ServiceId,
        on_complete: RcCompletion,
        on_error: RcError,
    ) -> RegistrationId {
        let id = self.next_id();
        self.completion_handlers.insert((service, id), (on_complete, on_error));
        id
    }

    pub fn remove_completion_handlers(&mut self, service: ServiceId, id: RegistrationId) {
        self.completion_handlers.remove(&(service, id));
    }

    /// See `remove_event_listener_by_id`.
    pub fn remove_completion_handlers_by_id(&mut self, id: RegistrationId) {
        self.completion_handlers.retain(|(_, registration), _| *registration != id);
    }

    pub fn completion_handlers_for(&self, service: ServiceId) -> impl Iterator<Item = &(RcCompletion, RcError)> {
        self.completion_handlers
            .iter()
            .filter(move |((owner, _), _)| *owner == service)
            .map(|(_, handlers)| handlers)
    }
}

impl std::fmt::Debug for HandlerTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTables")
            .field("event_listener_types", &self.event_listeners.len())
            .field("tracker_types", &self.trackers.len())
            .field("interceptors", &self.interceptors.len())
            .field("completion_handlers", &self.completion_handlers.len())
            .finish()
    }
}

/// What kind of table entry a `RegistrationHandle` removes on drop.
enum Removal {
    EventListener { event_type: TypeTag },
    Tracker { interface: TypeTag },
    Interceptor,
    CompletionHandlers { service: ServiceId },
}

/// RAII guard returned by every `Kernel::register_*` method. Dropping it
/// pushes the matching `Remove*Event` at the kernel-internal priority band
/// rather than mutating the table directly — table mutation only ever
/// happens from inside the scheduler loop's own dispatch (§4.2).
pub struct RegistrationHandle {
    queue: Rc<dyn EventQueue>,
    origin: ServiceId,
    registration: RegistrationId,
    removal: Removal,
}

impl RegistrationHandle {
    pub(crate) fn new_event_listener(
        queue: Rc<dyn EventQueue>,
        origin: ServiceId,
        registration: RegistrationId,
        event_type: TypeTag,
    ) -> Self {
        Self {
            queue,
            origin,
            registration,
            removal: Removal::EventListener { event_type },
        }
    }

    pub(crate) fn new_tracker(
        queue: Rc<dyn EventQueue>,
        origin: ServiceId,
        registration: RegistrationId,
        interface: TypeTag,
    ) -> Self {
        Self {
            queue,
            origin,
            registration,
            removal: Removal::Tracker { interface },
        }
    }

    pub(crate) fn new_interceptor(queue: Rc<dyn EventQueue>, origin: ServiceId, registration: RegistrationId) -> Self {
        Self {
            queue,
            origin,
            registration,
            removal: Removal::Interceptor,
        }
    }

    pub(crate) fn new_completion_handlers(
        queue: Rc<dyn EventQueue>,
        origin: ServiceId,
        registration: RegistrationId,
        service: ServiceId,
    ) -> Self {
        Self {
            queue,
            origin,
            registration,
            removal: Removal::CompletionHandlers { service },
        }
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        use crate::event::builtin::{
            RemoveCompletionCallbacksEvent, RemoveEventHandlerEvent, RemoveInterceptorEvent, RemoveTrackerEvent,
        };
        use crate::event::Priority;

        let registration = self.registration;
        match &self.removal {
            Removal::EventListener { .. } => {
                self.queue.push(Event::new(
                    crate::types::EventId::from_raw(0),
                    self.origin,
                    Priority::LIFECYCLE,
                    RemoveEventHandlerEvent { registration },
                ));
            }
            Removal::Tracker { .. } => {
                self.queue.push(Event::new(
                    crate::types::EventId::from_raw(0),
                    self.origin,
                    Priority::LIFECYCLE,
                    RemoveTrackerEvent { registration },
                ));
            }
            Removal::Interceptor => {
                self.queue.push(Event::new(
                    crate::types::EventId::from_raw(0),
                    self.origin,
                    Priority::LIFECYCLE,
                    RemoveInterceptorEvent { registration },
                ));
            }
            Removal::CompletionHandlers { .. } => {
                self.queue.push(Event::new(
                    crate::types::EventId::from_raw(0),
                    self.origin,
                    Priority::LIFECYCLE,
                    RemoveCompletionCallbacksEvent { registration },
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MultimapQueue;

    #[test]
    fn add_and_remove_event_listener() {
        let mut tables = HandlerTables::new();
        let tag = TypeTag::of::<u32>();
        let id = tables.add_event_listener(tag, Rc::new(|_event: Rc<Event>| async {}));
        assert_eq!(tables.listeners_for(tag).count(), 1);
        tables.remove_event_listener(tag, id);
        assert_eq!(tables.listeners_for(tag).count(), 0);
    }

    #[test]
    fn completion_handlers_scoped_per_service() {
        let mut tables = HandlerTables::new();
        let service_a = ServiceId::from_raw(1);
        let service_b = ServiceId::from_raw(2);
        tables.add_completion_handlers(service_a, Rc::new(|_| {}), Rc::new(|_, _| {}));
        tables.add_completion_handlers(service_b, Rc::new(|_| {}), Rc::new(|_, _| {}));
        assert_eq!(tables.completion_handlers_for(service_a).count(), 1);
        assert_eq!(tables.completion_handlers_for(service_b).count(), 1);
    }

    #[test]
    fn drop_pushes_remove_event_instead_of_mutating_directly() {
        let queue: Rc<dyn EventQueue> = Rc::new(MultimapQueue::new());
        let tag = TypeTag::of::<u32>();
        {
            let _handle = RegistrationHandle::new_event_listener(
                queue.clone(),
                ServiceId::from_raw(1),
                RegistrationId::from_raw(1),
                tag,
            );
            assert!(queue.empty());
        }
        assert!(!queue.empty());
    }
}
