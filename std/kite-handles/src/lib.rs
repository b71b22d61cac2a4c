//!
//! kite-handles - Concurrent Handle Tables
//!
//! A `HandleTable<V>` maps auto-incrementing 32-bit ids to native-owned values.
//! One mutex guards the map and the id counter, and every operation holds it
//! for its whole duration. Handles are created once per logical session (a
//! worker, a connection, a job) rather than per operation, so contention stays
//! low.
//!
//! Three kinds of value are stored in practice:
//! - `NativePtr` - an opaque address the table never interprets
//! - `StablePtr` - a transferred managed object, disposed when its entry goes
//! - nested state such as a per-connection statement cache
//!

pub mod error;
pub mod handle;
pub mod table;

pub use error::HandleError;
pub use handle::{Handle, NativePtr};
pub use table::HandleTable;
