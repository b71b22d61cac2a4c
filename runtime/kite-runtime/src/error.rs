///
/// Runtime error types.
///

use std::path::PathBuf;

use thiserror::Error;

use kite_core::{CoreError, FAULT_TYPE_CONFIG, FAULT_TYPE_INVALID_STATE};
use kite_handles::HandleError;
use kite_sqlite3::SqliteError;
use kite_threads::AccessError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Runtime is not initialized")]
    NotInitialized,

    #[error("Runtime is already initialized")]
    AlreadyInitialized,

    #[error("Null {0} object")]
    NullObject(&'static str),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Sqlite(#[from] SqliteError),
}

impl RuntimeError {
    pub fn fault_type(&self) -> i64 {
        match self {
            RuntimeError::Io { .. } | RuntimeError::Parse(_) | RuntimeError::Invalid(_) => FAULT_TYPE_CONFIG,
            RuntimeError::NotInitialized | RuntimeError::AlreadyInitialized | RuntimeError::NullObject(_) => {
                FAULT_TYPE_INVALID_STATE
            }
            RuntimeError::Core(e) => e.fault_type(),
            RuntimeError::Handle(e) => e.fault_type(),
            RuntimeError::Access(e) => e.fault_type(),
            RuntimeError::Sqlite(e) => e.fault_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::{FAULT_TYPE_ACCESS, FAULT_TYPE_LOOKUP_MISS};
    use kite_handles::Handle;

    #[test]
    fn test_fault_types() {
        assert_eq!(RuntimeError::Invalid("x".into()).fault_type(), FAULT_TYPE_CONFIG);
        assert_eq!(RuntimeError::NotInitialized.fault_type(), FAULT_TYPE_INVALID_STATE);

        let miss = HandleError::NotFound {
            table: "object",
            handle: Handle::new(9),
        };
        assert_eq!(RuntimeError::from(miss).fault_type(), FAULT_TYPE_LOOKUP_MISS);

        let not_open = AccessError::NotOpen {
            handle: Handle::new(3),
        };
        assert_eq!(RuntimeError::from(not_open).fault_type(), FAULT_TYPE_ACCESS);
    }

    #[test]
    fn test_wrapped_messages_are_transparent() {
        let err = RuntimeError::from(CoreError::UnknownTransferMode(7));
        assert_eq!(err.to_string(), "Unknown transfer mode 7");
    }
}
