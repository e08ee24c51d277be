//! Cross-kernel communication channel (§5).
//!
//! §5 allows multiple kernels (each its own scheduler loop on its own
//! thread) to be linked by a channel that forwards selected events between
//! their queues. The teacher reserved a `commbus` module for exactly this
//! and never filled it in; this completes it.

use std::collections::HashSet;
use std::rc::Rc;

use crate::event::{Event, Priority};
use crate::queue::EventQueue;
use crate::types::{EventId, ServiceId, TypeTag};

/// Links a source queue to a destination queue, forwarding only events whose
/// type tag is in `forward` (an empty set forwards nothing; there is no
/// "forward everything" sentinel, since blind forwarding would leak
/// service-local built-in events like `ContinuableEvent` across kernels,
/// where `PromiseId`s aren't valid).
pub struct CommChannel {
    source: Rc<dyn EventQueue>,
    destination: Rc<dyn EventQueue>,
    forward: HashSet<TypeTag>,
    /// The identity the forwarded event's `origin` is rewritten to on the
    /// destination side, since the source's `ServiceId` space means nothing
    /// on the destination kernel.
    relay_origin: ServiceId,
}

impl CommChannel {
    pub fn new(source: Rc<dyn EventQueue>, destination: Rc<dyn EventQueue>, relay_origin: ServiceId) -> Self {
        Self {
            source,
            destination,
            forward: HashSet::new(),
            relay_origin,
        }
    }

    pub fn allow(&mut self, type_tag: TypeTag) {
        self.forward.insert(type_tag);
    }

    pub fn disallow(&mut self, type_tag: TypeTag) {
        self.forward.remove(&type_tag);
    }

    /// Pop and forward at most one event, if one is both available and
    /// matches the forwarding predicate. Non-matching events are dropped —
    /// a channel only drains what it's told to relay, everything else is
    /// this kernel's own internal traffic and never meant to cross kernels.
    ///
    /// Returns whether an event was forwarded.
    pub fn forward_once(&self) -> bool {
        let Some(event) = self.source.pop_highest_priority() else {
            return false;
        };
        if !self.forward.contains(&event.type_tag()) {
            tracing::debug!(type_tag = %event.type_tag(), "commbus dropping non-forwarded event");
            return false;
        }
        let priority = event.priority();
        let type_tag = event.type_tag();
        tracing::debug!(%type_tag, "commbus forwarding event");
        // Re-tag with a fresh id on the destination side: EventQueue ids are
        // queue-local, so the source's id has no meaning there.
        let relayed = Event::new(EventId::from_raw(0), self.relay_origin, priority, RelayedPayload { inner: event });
        self.destination.push(relayed);
        true
    }

    /// Drain every currently-forwardable event from the source queue.
    /// Intended to be polled once per scheduler loop iteration on whichever
    /// kernel owns the source side of the channel, not run as its own
    /// blocking loop.
    pub fn drain(&self) {
        while !self.source.empty() {
            if !self.forward_once() {
                // Either nothing was poppable (queue went empty under us)
                // or the popped event didn't match; either way, nothing
                // more to do until the next scheduler tick.
                break;
            }
        }
    }
}

/// Carries a forwarded event across the type-erasure boundary: the
/// destination kernel doesn't know the concrete payload type statically, so
/// the relayed event's own payload is this wrapper, and destination-side
/// listeners downcast through it to the original event.
struct RelayedPayload {
    inner: Event,
}

impl RelayedPayload {
    /// Recover the original event a destination-side listener for relayed
    /// traffic downcasts through.
    #[allow(dead_code)]
    pub(crate) fn into_inner(self) -> Event {
        self.inner
    }
}

impl std::fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommChannel")
            .field("forwarded_types", &self.forward.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MultimapQueue;

    #[test]
    fn forward_once_relays_allowed_type_and_drops_others() {
        let source: Rc<dyn EventQueue> = Rc::new(MultimapQueue::new());
        let destination: Rc<dyn EventQueue> = Rc::new(MultimapQueue::new());
        let mut channel = CommChannel::new(source.clone(), destination.clone(), ServiceId::from_raw(1));
        channel.allow(TypeTag::of::<u32>());

        source.push(Event::new(EventId::from_raw(0), ServiceId::from_raw(2), Priority::USER_DEFAULT, 7u32));
        source.push(Event::new(EventId::from_raw(0), ServiceId::from_raw(2), Priority::USER_DEFAULT, "not forwarded"));

        assert!(channel.forward_once());
        assert!(!destination.empty());
        // The second, non-matching event is dropped rather than forwarded.
        assert!(!channel.forward_once());
        assert_eq!(destination.size(), 1);
    }
}
