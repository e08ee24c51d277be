//! Service registry: owns every service's `LifecycleManager` and the
//! secondary interface index used to resolve dependencies (§4.7).
//!
//! Split from `lifecycle.rs` the same way the teacher keeps `kernel/services.rs`
//! (a stats/lookup layer) separate from `kernel/lifecycle.rs` (the state
//! driver) — here the driver is one-manager-per-service, and the registry is
//! the thing that knows about *all* of them at once.

use std::collections::HashMap;

use crate::lifecycle::LifecycleManager;
use crate::service::{DependencyDeclaration, ServiceDescriptor, ServiceKind, ServiceState};
use crate::types::{IdCounter, ServiceId, TypeTag};

/// Owns every installed service and the `TypeTag -> [ServiceId]` index used
/// to answer "who implements this interface" without scanning every
/// manager.
#[derive(Default)]
pub struct ServiceRegistry {
    ids: IdCounter,
    managers: HashMap<ServiceId, LifecycleManager>,
    /// Interfaces each service *exposes*, independent of lifecycle state —
    /// used to find start-time candidates; callers filter by `Active` state
    /// themselves via `get_started`.
    interface_index: HashMap<TypeTag, Vec<ServiceId>>,
    /// Reverse of `interface_index`: which tags a given service exposes.
    /// Needed when a service goes offline — its dependants must be told
    /// exactly which of *their* declared interfaces just lost a candidate,
    /// without scanning every tag in `interface_index`.
    exposed_by: HashMap<ServiceId, Vec<TypeTag>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh `ServiceId` and install a new, `Installed`-state
    /// manager for it. Does not start the service — that's a separate
    /// `StartServiceEvent`.
    pub fn insert(
        &mut self,
        kind: ServiceKind,
        dependencies: Vec<DependencyDeclaration>,
        exposes: Vec<TypeTag>,
    ) -> ServiceId {
        let id = ServiceId::from_raw(self.ids.next());
        let descriptor = ServiceDescriptor::new(id, kind);
        let manager = LifecycleManager::new(descriptor, dependencies);
        self.managers.insert(id, manager);
        self.add_exposed(id, &exposes);
        id
    }

    /// Register additional interfaces `service` exposes, e.g. ones only
    /// known once an `Advanced` service's builder runs or a
    /// `ConstructorInjected` service finishes injection. Idempotent per tag.
    pub fn add_exposed(&mut self, service: ServiceId, tags: &[TypeTag]) {
        for &tag in tags {
            let bucket = self.interface_index.entry(tag).or_default();
            if !bucket.contains(&service) {
                bucket.push(service);
            }
        }
        let reverse = self.exposed_by.entry(service).or_default();
        for &tag in tags {
            if !reverse.contains(&tag) {
                reverse.push(tag);
            }
        }
    }

    /// Tags `service` currently exposes, per `add_exposed`/`insert`.
    pub fn exposed_tags(&self, service: ServiceId) -> &[TypeTag] {
        self.exposed_by.get(&service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, id: ServiceId) -> Option<&LifecycleManager> {
        self.managers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut LifecycleManager> {
        self.managers.get_mut(&id)
    }

    /// Remove a service entirely. Only valid once its manager has reached
    /// `Installed` (fully stopped) or `Uninstalled`; callers enforce the
    /// state check before calling this (the registry itself only removes
    /// bookkeeping, it doesn't second-guess the transition).
    pub fn remove(&mut self, id: ServiceId) -> Option<LifecycleManager> {
        let manager = self.managers.remove(&id)?;
        for ids in self.interface_index.values_mut() {
            ids.retain(|candidate| *candidate != id);
        }
        self.exposed_by.remove(&id);
        Some(manager)
    }

    /// Candidate services exposing `interface`, in insertion order.
    pub fn candidates_for(&self, interface: TypeTag) -> impl Iterator<Item = ServiceId> + '_ {
        self.interface_index.get(&interface).into_iter().flat_map(|ids| ids.iter().copied())
    }

    /// Services exposing `interface` that are currently `Active`, ordered
    /// by ascending priority (ties broken by `ServiceId` for determinism) —
    /// §4.7's `get_started::<I>()`.
    pub fn get_started(&self, interface: TypeTag) -> Vec<ServiceId> {
        let mut started: Vec<ServiceId> = self
            .candidates_for(interface)
            .filter(|id| {
                self.managers
                    .get(id)
                    .map(|manager| manager.state() == ServiceState::Active)
                    .unwrap_or(false)
            })
            .collect();
        started.sort_by_key(|id| {
            let priority = self.managers.get(id).map(|m| m.descriptor().priority).unwrap_or(0);
            (priority, id.as_u64())
        });
        started
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.managers.keys().copied()
    }

    pub fn count_by_state(&self, state: ServiceState) -> usize {
        self.managers.values().filter(|manager| manager.state() == state).count()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.managers.len())
            .field("interfaces", &self.interface_index.len())
            .finish()
    }
}
