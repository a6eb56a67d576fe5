#![forbid(unsafe_code)]
//! MistFS public API facade.
//!
//! Re-exports the core tree, the shared-memory model, and the serving layer
//! through one stable external interface. This is the crate that downstream
//! consumers (the VFS integration and the harness) depend on.

pub use mist_core::*;
pub use mist_error::{MistError, Result};
pub use mist_mem::{Mapping, MemHandle};
pub use mist_serve::*;
pub use mist_types::*;
