//! Strongly-typed identifiers.
//!
//! `ServiceId` and `EventId` are cheap, `Copy`, counter-backed handles used as
//! hot-path map keys. `ServiceUuid` is the cross-process-stable identity a
//! service also carries (UUID v4), separate from its process-local
//! `ServiceId` so that two kernels in the same process never collide.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Macro to define a counter-backed id newtype.
///
/// Generates: struct, raw accessors, `Display`, `Serialize`/`Deserialize`.
/// Unlike the string-newtype ids this replaces, these are `Copy` — the
/// scheduler loop compares and hashes them constantly.
macro_rules! define_counter_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Construct directly from a raw value. Used by `IdCounter` and
            /// by tests that need a specific id.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_counter_id!(ServiceId);
define_counter_id!(EventId);

/// Monotonic counter producing consecutive ids starting at 1 (0 is reserved
/// as a "no id" sentinel).
#[derive(Debug, Default)]
pub struct IdCounter(AtomicU64);

impl IdCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Allocate the next raw id. Thread-safe; used both for `ServiceId`
    /// allocation on the owning thread and for `EventId` allocation from any
    /// producer thread pushing into the queue.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Globally-unique, cross-process service identity.
///
/// Every service carries one of these in addition to its process-local
/// `ServiceId`, per the data model's distinction between process-local and
/// cross-process identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceUuid(uuid::Uuid);

impl ServiceUuid {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for ServiceUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable type identity used for both event-type tags and interface tags.
///
/// Wraps `std::any::TypeId` — per the design notes, this is the
/// "`TypeId`-like value" a statically typed target language should use in
/// place of a runtime string hash, and it is already const-comparable with
/// no string work on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(std::any::TypeId);

impl TypeTag {
    pub fn of<T: 'static + ?Sized>() -> Self {
        Self(std::any::TypeId::of::<T>())
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
