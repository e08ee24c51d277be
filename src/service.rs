//! Services, interfaces, and the lifecycle state machine (§3, §4.4).

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::types::{ServiceId, ServiceUuid, TypeTag};

/// A service's dynamic properties. Order-preserving: a service that iterates
/// its own properties (for logging, diagnostics) sees them in registration
/// order, which `HashMap` cannot guarantee.
pub type PropertyMap = IndexMap<String, Value>;

/// How a service came to exist.
///
/// `ConstructorInjected` services receive their required dependencies as
/// constructor arguments, built once all of them are `Active`; `Advanced`
/// services manage their own dependencies via `add_dependency`/
/// `remove_dependency` callbacks and may start before every dependency is
/// satisfied (deferring the unsatisfied ones as optional).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    ConstructorInjected,
    Advanced,
}

/// Lifecycle states a service moves through, per §3's state machine. Every
/// transition not listed in `can_transition_to` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ServiceState {
    Installed,
    Starting,
    Injecting,
    Active,
    Uninjecting,
    Stopping,
    Uninstalled,
}

impl ServiceState {
    /// Valid transitions, mirroring the teacher's `ProcessState::can_transition_to`
    /// match-arm style.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Installed, Starting)
                | (Starting, Injecting)
                | (Starting, Installed) // start failed before injection began
                | (Injecting, Active)
                | (Injecting, Stopping) // a dependency callback failed mid-injection
                | (Active, Uninjecting)
                | (Uninjecting, Stopping)
                | (Stopping, Installed) // stopped, eligible to start again
                | (Stopping, Uninstalled) // stopped as part of removal
                | (Installed, Uninstalled)
        )
    }

    /// Whether the service is far enough along to satisfy a dependant.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Active)
    }

    /// Whether the service is still installed at all (not torn down).
    pub fn is_installed(self) -> bool {
        !matches!(self, ServiceState::Uninstalled)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A filter over candidate services, used by dependency trackers and
/// `get_started` lookups to narrow which services a dependency is allowed to
/// bind to.
#[derive(Clone)]
pub enum Filter {
    /// Matches a specific service id only.
    ServiceId(ServiceId),
    /// Matches services carrying a property equal to the given value.
    PropertyEquals { key: String, value: Value },
    /// Matches the logical negation of the inner filter.
    Not(Box<Filter>),
    /// Matches when both inner filters match.
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn matches(&self, id: ServiceId, properties: &PropertyMap) -> bool {
        match self {
            Filter::ServiceId(expected) => *expected == id,
            Filter::PropertyEquals { key, value } => properties.get(key) == Some(value),
            Filter::Not(inner) => !inner.matches(id, properties),
            Filter::And(a, b) => a.matches(id, properties) && b.matches(id, properties),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::ServiceId(id) => write!(f, "Filter::ServiceId({id})"),
            Filter::PropertyEquals { key, value } => {
                write!(f, "Filter::PropertyEquals({key:?}, {value})")
            }
            Filter::Not(inner) => write!(f, "Filter::Not({inner:?})"),
            Filter::And(a, b) => write!(f, "Filter::And({a:?}, {b:?})"),
        }
    }
}

/// A declared dependency of a service.
#[derive(Debug, Clone)]
pub struct DependencyDeclaration {
    pub interface: TypeTag,
    pub required: bool,
    pub filter: Option<Filter>,
    /// How many candidates currently satisfy this declaration. A `required`
    /// declaration with `satisfied == 0` blocks `Starting -> Injecting`.
    pub satisfied: usize,
}

impl DependencyDeclaration {
    pub fn required(interface: TypeTag) -> Self {
        Self {
            interface,
            required: true,
            filter: None,
            satisfied: 0,
        }
    }

    pub fn optional(interface: TypeTag) -> Self {
        Self {
            interface,
            required: false,
            filter: None,
            satisfied: 0,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn is_satisfied(&self) -> bool {
        !self.required || self.satisfied > 0
    }
}

/// The tagged-vector representation of a live service's injected interfaces
/// (§9): each entry is an interface tag paired with a type-erased pointer to
/// the data implementing it. Open and cheap to extend at runtime from
/// `add_dependency`, unlike a variadic-generic manager fixed at compile time.
#[derive(Default)]
pub struct InterfaceTable {
    entries: Vec<(TypeTag, Rc<dyn Any>)>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any>(&mut self, value: Rc<T>) {
        self.entries.push((TypeTag::of::<T>(), value));
    }

    /// Insert a value whose interface tag is already known, for callers
    /// that only have a `Rc<dyn Any>` (the dependency-injection path, which
    /// receives candidates from the registry already type-erased).
    pub fn insert_dyn(&mut self, tag: TypeTag, value: Rc<dyn Any>) {
        self.entries.push((tag, value));
    }

    pub fn get<T: Any>(&self) -> Option<Rc<T>> {
        self.entries
            .iter()
            .find(|(tag, _)| *tag == TypeTag::of::<T>())
            .and_then(|(_, value)| value.clone().downcast::<T>().ok())
    }

    /// Fetch a value by its type tag without a static type, for callers that
    /// only know which interface they want at runtime (dependency injection:
    /// a candidate's exposed interface tag comes from the registry, not from
    /// a generic parameter at the call site).
    pub fn get_dyn(&self, tag: TypeTag) -> Option<Rc<dyn Any>> {
        self.entries
            .iter()
            .find(|(entry_tag, _)| *entry_tag == tag)
            .map(|(_, value)| value.clone())
    }

    pub fn remove(&mut self, tag: TypeTag) {
        self.entries.retain(|(entry_tag, _)| *entry_tag != tag);
    }

    pub fn tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.entries.iter().map(|(tag, _)| *tag)
    }
}

impl fmt::Debug for InterfaceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceTable")
            .field("interfaces", &self.entries.len())
            .finish()
    }
}

/// Static identity and metadata for an installed service. The live,
/// type-erased service object itself is owned by the per-service
/// `LifecycleManager` (see `lifecycle.rs`), which also drives the state
/// machine; `ServiceDescriptor` is the part the registry and dependency
/// graph need without touching the service object.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub uuid: ServiceUuid,
    pub kind: ServiceKind,
    pub properties: PropertyMap,
    pub priority: i32,
}

impl ServiceDescriptor {
    pub fn new(id: ServiceId, kind: ServiceKind) -> Self {
        Self {
            id,
            uuid: ServiceUuid::new(),
            kind,
            properties: PropertyMap::new(),
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_table_matches_state_machine() {
        use ServiceState::*;
        assert!(Installed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Injecting));
        assert!(Injecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Uninjecting));
        assert!(Uninjecting.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Installed));
        assert!(Stopping.can_transition_to(Uninstalled));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        use ServiceState::*;
        assert!(!Installed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Installed));
        assert!(!Uninstalled.can_transition_to(Starting));
    }

    #[test]
    fn interface_table_roundtrips_and_removes() {
        let mut table = InterfaceTable::new();
        table.insert(Rc::new(42u32));
        assert_eq!(table.get::<u32>(), Some(Rc::new(42)));
        table.remove(TypeTag::of::<u32>());
        assert_eq!(table.get::<u32>(), None);
    }

    #[test]
    fn filter_and_not_compose() {
        let mut properties = PropertyMap::new();
        properties.insert("role".to_string(), Value::String("primary".to_string()));
        let id = ServiceId::from_raw(7);

        let is_primary = Filter::PropertyEquals {
            key: "role".to_string(),
            value: Value::String("primary".to_string()),
        };
        assert!(is_primary.matches(id, &properties));

        let not_primary = Filter::Not(Box::new(is_primary.clone()));
        assert!(!not_primary.matches(id, &properties));

        let id_and_role = Filter::And(Box::new(Filter::ServiceId(id)), Box::new(is_primary));
        assert!(id_and_role.matches(id, &properties));
    }
}
