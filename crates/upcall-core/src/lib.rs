//! # upcall-core — wire types for the upcall kernel ABI
//!
//! This crate defines the ABI shared between userspace and the kernel's
//! upcall syscalls (`upcall_create`, `upcall_submit`). Every other crate in
//! this workspace depends on these types rather than redefining them.
//!
//! Nothing here performs I/O. That's `upcall-runtime`'s job.

pub mod entry;
pub mod flags;
pub mod error;
