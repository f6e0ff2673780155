//! The upcall worker fabric, buffer cache, topology resolver, and batched
//! event loop — the mechanics behind the ABI types in `upcall-core`.
//!
//! Mirrors `ksvc-module` + `ksvc-executor` combined: this system has one
//! real backend, not a family of swappable ones, so the split the teacher
//! workspace makes between trait-holder and implementation-holder collapses
//! into this single crate.

pub mod buffer;
pub mod eventloop;
pub mod syscall;
pub mod topology;
pub mod worker;

#[cfg(feature = "legacy")]
pub mod legacy;

pub use eventloop::{run_event_loop, upcall_worker_setup, Worker};
pub use worker::{init_event_handler, EventHandler, EventHandlerBuilder, EventHandlerConfig};

#[cfg(feature = "legacy")]
pub use legacy::{init_legacy_event_handler, EventRegistry, LegacyEventHandler};
