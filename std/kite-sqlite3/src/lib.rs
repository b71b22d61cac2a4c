///
/// kite SQLite3 Support
///
/// Architecture:
/// - `DatabaseRegistry` keeps one `DatabaseInfo` per open connection, keyed by
///   a data id from a two-step `next_data_id` / `create_data_store` handshake,
///   plus a side table of helper objects.
/// - Each `DatabaseInfo` owns a `StatementCache`: an LRU of SQL text to
///   statement object. Evicting an entry finalizes the native statement
///   through a `StatementFinalizer` before the cache lets go of it.
/// - `SqliteConnection` wraps a rusqlite connection and compiles statements
///   through that cache. Statement objects carry their rusqlite statement in
///   the object's meta slot, so a finalized statement fails cleanly instead
///   of touching freed memory.
/// - `CursorWindow` is a bounded row buffer filled by
///   `execute_for_cursor_window`.
///

pub mod cache;
pub mod connection;
pub mod database;
pub mod error;
pub mod window;

pub use cache::*;
pub use connection::*;
pub use database::*;
pub use error::*;
pub use window::*;
