//!
//! kite-core - Managed Object Model
//!
//! This crate provides the fundamental types shared across all kite crates:
//!
//! - `HeapHeader`, `HeapTag` and `ManagedRef` for reference-counted managed objects
//! - `StablePtr`, an owning token for an object handed over to native storage
//! - `transfer` / `StablePtr::adopt`, the CHECKED/UNCHECKED ownership protocol
//! - `Fault` and the thread-local fault slot used at the foreign boundary
//! - UTF-16 helpers for strings arriving from the host runtime
//!
//! Managed objects are immutable once built. Their reference counts are
//! observable, which is what lets a CHECKED transfer prove that nobody outside
//! the transferred subgraph still holds a reference into it.
//!

pub mod error;
pub mod exception;
pub mod stable;
pub mod strings;
pub mod transfer;
pub mod value;

pub use error::*;
pub use exception::*;
pub use stable::*;
pub use strings::*;
pub use transfer::*;
pub use value::*;
