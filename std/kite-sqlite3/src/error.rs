///
/// SQLite adapter error types.
///

use thiserror::Error;

use kite_core::{FAULT_TYPE_CONFIG, FAULT_TYPE_INVALID_STATE, FAULT_TYPE_NATIVE_LIBRARY};
use kite_handles::HandleError;

use crate::window::WindowError;

#[derive(Debug, Error)]
pub enum SqliteError {
    /// An error reported by SQLite itself
    #[error("{message} (code {code})")]
    Native { code: i32, message: String },

    #[error("Statement cache size {0} is out of range (0..=100)")]
    CacheSizeOutOfRange(i64),

    #[error("Database {path} could not be opened for writing")]
    ReadOnly { path: String },

    #[error("Statement has been finalized: {sql}")]
    Finalized { sql: String },

    #[error("Object is not a prepared statement of this connection")]
    NotAStatement,

    #[error("Connection is closed")]
    Closed,

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Handle(#[from] HandleError),
}

impl SqliteError {
    /// Build a native error, appending the SQL being compiled the way
    /// SQLite's own diagnostics are reported back to callers.
    pub fn while_compiling(err: rusqlite::Error, sql: &str) -> Self {
        match SqliteError::from(err) {
            SqliteError::Native { code, message } => SqliteError::Native {
                code,
                message: format!("{message}, while compiling: {sql}"),
            },
            other => other,
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            SqliteError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn fault_type(&self) -> i64 {
        match self {
            SqliteError::Native { .. } | SqliteError::ReadOnly { .. } => FAULT_TYPE_NATIVE_LIBRARY,
            SqliteError::CacheSizeOutOfRange(_) => FAULT_TYPE_CONFIG,
            SqliteError::Finalized { .. } | SqliteError::NotAStatement | SqliteError::Closed => {
                FAULT_TYPE_INVALID_STATE
            }
            SqliteError::Window(_) => FAULT_TYPE_NATIVE_LIBRARY,
            SqliteError::Handle(e) => e.fault_type(),
        }
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(inner, message) => SqliteError::Native {
                code: inner.extended_code,
                message: message.unwrap_or_else(|| inner.to_string()),
            },
            other => SqliteError::Native {
                code: -1,
                message: other.to_string(),
            },
        }
    }
}
