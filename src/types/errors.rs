//! Kernel error taxonomy (§7).
//!
//! All errors use `thiserror` for automatic `Error` trait derivation.
//! Kernel-internal failures are never propagated out of the scheduler loop —
//! they are converted into events (a `StopServiceEvent` carrying the cause)
//! or delivered to whichever coroutine is awaiting the relevant event id. The
//! loop itself never returns one of these; it only appears in library-surface
//! `Result`s such as `Kernel::create_service` or a service's `start()`.

use thiserror::Error;

/// Kernel result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Kernel error taxonomy.
#[derive(Error, Debug)]
pub enum Error {
    /// A service's `start()` or constructor-injected construction failed.
    /// Surfaced to awaiters of that start.
    #[error("start error for service {service}: {reason}")]
    StartError { service: String, reason: String },

    /// A required dependency could not be satisfied within the configured
    /// wait. Surfaced to awaiters.
    #[error("dependency error for service {service}: {reason}")]
    DependencyError { service: String, reason: String },

    /// An awaitable completed because the awaiting service or its kernel is
    /// shutting down.
    #[error("service {service} is quitting")]
    ServiceQuitting { service: String },

    /// Push after `quit()`; the push was dropped.
    #[error("queue closed: {0}")]
    QueueClosed(String),

    /// A user callback panicked or returned an error. `add_dependency`
    /// callbacks that fail this way push the service back to `Installed`;
    /// `remove_dependency` callbacks that fail this way abort the process
    /// (see `lifecycle::LifecycleManager::remove_dependency`).
    #[error("callback failure in {context}: {reason}")]
    CallbackFailure { context: String, reason: String },

    /// A hardened-mode invariant was violated (e.g. a service touched from a
    /// thread other than its owning kernel thread). The process terminates
    /// rather than continuing with corrupted state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Request is malformed or references something that does not exist.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition attempted.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Catch-all for errors that don't fit a more specific family.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors (service properties, config).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (ring-buffer queue setup, config loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors, matching the teacher's `validation`/`not_found`
// style.
impl Error {
    pub fn start_error(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StartError {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn dependency_error(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DependencyError {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn service_quitting(service: impl Into<String>) -> Self {
        Self::ServiceQuitting {
            service: service.into(),
        }
    }

    pub fn queue_closed(msg: impl Into<String>) -> Self {
        Self::QueueClosed(msg.into())
    }

    pub fn callback_failure(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CallbackFailure {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
