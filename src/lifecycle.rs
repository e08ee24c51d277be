//! Per-service lifecycle state machine (§3, §4.4).
//!
//! Each service gets its own `LifecycleManager` instance, owned by the
//! `ServiceRegistry` in a map keyed on `ServiceId` — this is the one place
//! the design departs from the teacher's single shared scheduler: the
//! teacher's `LifecycleManager` manages every process in one `HashMap`, but
//! here a manager's whole job is one service, so the map lives one level up
//! in `registry.rs` and each entry is this struct.
//!
//! The state-checked, `Result`-returning transition style (one method per
//! edge, `Error::state_transition` on an illegal edge) is carried over from
//! the teacher's `schedule`/`start`/`wait`/`resume`/`terminate` methods.

use std::any::Any;
use std::rc::Rc;

use crate::kernel::recovery::with_recovery;
use crate::service::{DependencyDeclaration, InterfaceTable, ServiceDescriptor, ServiceState};
use crate::types::{Error, Result, ServiceId, TypeTag};

/// Why a service is being stopped, for attribution in logs and in the error
/// surfaced to anything awaiting it.
#[derive(Debug, Clone)]
pub enum StopCause {
    Requested,
    StartFailed(String),
    DependencyFailed { dependency: ServiceId, reason: String },
}

/// Advanced-service callbacks. A constructor-injected service has no
/// callbacks at all — its dependencies are resolved once, up front, by a
/// builder the registry invokes when every required interface has a
/// candidate (§9: "builder closure instead of constructor reflection").
#[derive(Default)]
pub struct DependencyCallbacks {
    #[allow(clippy::type_complexity)]
    pub on_add: Option<Box<dyn FnMut(TypeTag, Rc<dyn Any>) -> Result<()>>>,
    #[allow(clippy::type_complexity)]
    pub on_remove: Option<Box<dyn FnMut(TypeTag) -> Result<()>>>,
}

/// Owns one service's lifecycle state, declared dependencies, exposed
/// interfaces, and (for `Advanced` services) its dependency callbacks.
pub struct LifecycleManager {
    descriptor: ServiceDescriptor,
    state: ServiceState,
    dependencies: Vec<DependencyDeclaration>,
    interfaces: InterfaceTable,
    callbacks: DependencyCallbacks,
    stop_cause: Option<StopCause>,
}

impl LifecycleManager {
    pub fn new(descriptor: ServiceDescriptor, dependencies: Vec<DependencyDeclaration>) -> Self {
        Self {
            descriptor,
            state: ServiceState::Installed,
            dependencies,
            interfaces: InterfaceTable::new(),
            callbacks: DependencyCallbacks::default(),
            stop_cause: None,
        }
    }

    pub fn set_callbacks(&mut self, callbacks: DependencyCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn id(&self) -> ServiceId {
        self.descriptor.id
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut ServiceDescriptor {
        &mut self.descriptor
    }

    pub fn dependencies(&self) -> &[DependencyDeclaration] {
        &self.dependencies
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    pub fn stop_cause(&self) -> Option<&StopCause> {
        self.stop_cause.as_ref()
    }

    fn transition(&mut self, to: ServiceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "service {} cannot transition {:?} -> {:?}",
                self.descriptor.id, self.state, to
            )));
        }
        tracing::debug!(service = %self.descriptor.id, from = ?self.state, to = ?to, "lifecycle transition");
        self.state = to;
        Ok(())
    }

    /// Whether every required dependency currently has at least one
    /// satisfying candidate. Required for `Starting -> Injecting`.
    pub fn required_dependencies_satisfied(&self) -> bool {
        self.dependencies.iter().all(DependencyDeclaration::is_satisfied)
    }

    /// Begin starting: `Installed -> Starting`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(ServiceState::Starting)
    }

    /// `Starting -> Injecting`, only once required dependencies are
    /// satisfied; otherwise the caller should keep the service in
    /// `Starting` and wait for more `DependencyOnlineEvent`s.
    pub fn begin_injecting(&mut self) -> Result<()> {
        if !self.required_dependencies_satisfied() {
            return Err(Error::dependency_error(
                self.descriptor.id.to_string(),
                "not all required dependencies are satisfied",
            ));
        }
        self.transition(ServiceState::Injecting)
    }

    /// `Injecting -> Active`: injection completed without error.
    pub fn complete_injecting(&mut self) -> Result<()> {
        self.transition(ServiceState::Active)
    }

    /// A start or injection failure before the service ever reached
    /// `Active`. Per §7, `Starting` rolls straight back to `Installed`;
    /// `Injecting` goes through `Stopping` since dependencies may already
    /// have been partially injected and need unwinding.
    pub fn fail_start(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        match self.state {
            ServiceState::Starting => {
                self.stop_cause = Some(StopCause::StartFailed(reason));
                self.transition(ServiceState::Installed)
            }
            ServiceState::Injecting => {
                self.stop_cause = Some(StopCause::StartFailed(reason));
                self.transition(ServiceState::Stopping)
            }
            _ => Err(Error::state_transition(format!(
                "service {} cannot fail_start from {:?}",
                self.descriptor.id, self.state
            ))),
        }
    }

    /// `Active -> Uninjecting`: begin stopping a running service.
    pub fn begin_uninjecting(&mut self, cause: StopCause) -> Result<()> {
        self.stop_cause = Some(cause);
        self.transition(ServiceState::Uninjecting)
    }

    /// `Uninjecting -> Stopping`.
    pub fn complete_uninjecting(&mut self) -> Result<()> {
        self.transition(ServiceState::Stopping)
    }

    /// `Stopping -> Installed`: stopped, eligible to start again.
    pub fn complete_stop(&mut self) -> Result<()> {
        self.stop_cause = None;
        self.transition(ServiceState::Installed)
    }

    /// `Stopping -> Uninstalled` or `Installed -> Uninstalled`: removal.
    pub fn uninstall(&mut self) -> Result<()> {
        self.transition(ServiceState::Uninstalled)
    }

    /// A dependant of `interface` became available. Records it against any
    /// matching declaration, and for `Advanced` services runs the
    /// registered `on_add` callback, panic- and error-protected.
    ///
    /// A callback failure converts to an error and — per §7 — the service
    /// is pushed back toward `Installed` rather than propagating the panic;
    /// the caller (the kernel's event dispatch) is responsible for emitting
    /// the `StopServiceEvent` this implies.
    pub fn add_dependency(&mut self, interface: TypeTag, value: Rc<dyn Any>) -> Result<()> {
        for declaration in self.dependencies.iter_mut().filter(|d| d.interface == interface) {
            declaration.satisfied += 1;
        }
        self.interfaces.insert_dyn(interface, value.clone());

        if let Some(callback) = self.callbacks.on_add.as_mut() {
            let service = self.descriptor.id;
            with_recovery(
                || callback(interface, value.clone()),
                &format!("add_dependency({service})"),
            )?;
        }
        Ok(())
    }

    /// A previously-satisfying dependency went offline. Per §7's
    /// `remove_dependency` semantics, a callback failure here means the
    /// "survives its dependencies" invariant is already broken — the
    /// caller must abort the process rather than attempt further recovery.
    pub fn remove_dependency(&mut self, interface: TypeTag) -> Result<()> {
        for declaration in self.dependencies.iter_mut().filter(|d| d.interface == interface) {
            declaration.satisfied = declaration.satisfied.saturating_sub(1);
        }
        self.interfaces.remove(interface);

        if let Some(callback) = self.callbacks.on_remove.as_mut() {
            let service = self.descriptor.id;
            let result = with_recovery(|| callback(interface), &format!("remove_dependency({service})"));
            if let Err(err) = result {
                tracing::error!(service = %service, error = %err, "remove_dependency callback failed; aborting");
                std::process::abort();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("id", &self.descriptor.id)
            .field("state", &self.state)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}
