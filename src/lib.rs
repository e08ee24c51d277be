//! # Ichor — a single-threaded, event-driven service kernel
//!
//! Ichor runs a graph of in-process services on one cooperative scheduler
//! loop: services declare interfaces and dependencies, the kernel injects
//! one into the other as both sides become `Active`, and ordinary `async`
//! functions act as the kernel's coroutines — suspended at an `.await` and
//! resumed by re-entering the event queue rather than by blocking a thread.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────────────┐
//!   services  ───────▶          Kernel (one thread)      │
//!   register/push     │  ┌─────────┐   ┌──────────────┐  │
//!                      │  │ Event   │   │ Service      │  │
//!                      │  │ Queue   │──▶│ Registry     │  │
//!                      │  └─────────┘   └──────────────┘  │
//!                      │  ┌─────────┐   ┌──────────────┐  │
//!                      │  │Dependency│  │ Coroutine /   │  │
//!                      │  │  Graph   │  │ Continuation  │  │
//!                      │  └─────────┘   │ Table         │  │
//!                      │                └──────────────┘  │
//!                      └───────────────────────────────────┘
//! ```
//!
//! Unsafe code is `warn`, not `deny`, at the crate level: the io_uring queue
//! backend and the manual coroutine waker both carry a small, documented
//! amount of it (see `queue::uring` and `coroutine::ContinuationWaker`).
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod commbus;
pub mod coroutine;
pub mod event;
pub mod graph;
pub mod handlers;
pub mod kernel;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod service;
pub mod types;

pub mod observability;

pub use types::{Config, Error, Result};
