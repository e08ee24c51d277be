//! Core types for the Ichor kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: `ServiceId`, `EventId`, `ServiceUuid`, `TypeTag`.
//! - **Errors**: kernel error taxonomy with `thiserror` derives (§7).
//! - **Config**: configuration structures (§6).

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, ProvidedBufferRingConfig, SchedulerConfig, UringQueueConfig};
pub use errors::{Error, Result};
pub use ids::{EventId, IdCounter, ServiceId, ServiceUuid, TypeTag};
