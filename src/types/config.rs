//! Configuration structures (§6).
//!
//! No environment variables or on-disk state are part of the kernel itself —
//! `Config` is a plain value a host process builds and hands to
//! `Kernel::with_config`. The nested-struct-with-`#[serde(default)]` shape
//! is carried over from the teacher's `types::config` module so a host that
//! *does* want to load this from a file/env can `serde`-deserialize it
//! without the kernel depending on any particular config-loading crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Scheduler loop configuration (quit draining, poll cadence).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Ring-buffer (io_uring) event queue configuration. Only consulted when
    /// the kernel is constructed with the `io-uring` feature's queue
    /// implementation.
    #[serde(default)]
    pub uring: UringQueueConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// OTLP exporter endpoint (optional). Carried as a config field even
    /// though the kernel does not itself export traces — a host wiring in
    /// `tracing-opentelemetry` reads this.
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long the quit drain phase (§4.3 step 3) is allowed to run before
    /// outstanding coroutines are force-completed with `ServiceQuitting`.
    #[serde(with = "humantime_serde")]
    pub quit_timeout: Duration,

    /// How long the scheduler loop blocks waiting for the queue to become
    /// non-empty before re-checking the quit flag (§4.3 step 1a).
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quit_timeout: Duration::from_millis(1000),
            poll_timeout: Duration::from_millis(50),
        }
    }
}

/// io_uring ring-buffer queue configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UringQueueConfig {
    /// Submission/completion ring size, in entries.
    pub entries: u32,

    /// Poll timeout for the ring's `enter` call, in nanoseconds.
    pub poll_timeout_ns: u64,

    /// Emulate a specific kernel version's feature set instead of probing
    /// the running kernel. Used in tests that exercise the fallback path.
    pub emulated_kernel_version: Option<String>,

    /// Provided-buffer ring configuration, if the host wants the queue to
    /// register a buffer ring for batched completions.
    pub provided_buffer_ring: Option<ProvidedBufferRingConfig>,
}

impl Default for UringQueueConfig {
    fn default() -> Self {
        Self {
            entries: 256,
            poll_timeout_ns: 0,
            emulated_kernel_version: None,
            provided_buffer_ring: None,
        }
    }
}

/// Provided-buffer ring sizing, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidedBufferRingConfig {
    pub entries: u32,
    pub entry_size: u32,
}
