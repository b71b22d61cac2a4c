//!
//! kite-threads - Cross-Thread Ownership Primitives
//!
//! ## Dispatch
//!
//! `DispatchBroker` runs a job on the submitting thread, transfers its result
//! into a result table keyed by the caller's callback id, and posts a
//! completion notice to the `CompletionQueue`, which delivers it on its own
//! thread. The submitter later collects the result exactly once with
//! `pull_result`.
//!
//! ## AtomicData
//!
//! `AtomicDataTable` stores one transferred object per handle. Access is
//! exclusive: `open_access` hands the object out and blocks further openers
//! until `close_access` transfers a value back in. Removal waits for any
//! in-flight access to finish.
//!
//! ## Counters
//!
//! `counter_for` attaches an atomic counter to a managed object the first time
//! it is asked for and returns the same cell afterwards.
//!
//! ## Platform Support
//!
//! Native platforms only.
//!

pub mod atomic_data;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod queue;

pub use atomic_data::*;
pub use counter::*;
pub use dispatch::*;
pub use error::*;
pub use queue::*;
