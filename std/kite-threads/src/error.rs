///
/// Error types for dispatch and access stores.
///

use thiserror::Error;

use kite_core::{CoreError, FAULT_TYPE_ACCESS, FAULT_TYPE_UNKNOWN};
use kite_handles::{Handle, HandleError};

#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Data store {handle} is not open for access")]
    NotOpen { handle: Handle },

    #[error("Data store {handle} is being removed")]
    Removed { handle: Handle },

    #[error("Completion queue is shut down")]
    QueueClosed,

    #[error("Failed to start completion thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl AccessError {
    pub fn fault_type(&self) -> i64 {
        match self {
            AccessError::Core(e) => e.fault_type(),
            AccessError::Handle(e) => e.fault_type(),
            AccessError::NotOpen { .. } | AccessError::Removed { .. } => FAULT_TYPE_ACCESS,
            AccessError::QueueClosed | AccessError::Spawn(_) => FAULT_TYPE_UNKNOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::FAULT_TYPE_LOOKUP_MISS;

    #[test]
    fn test_error_display_and_fault_type() {
        let err = AccessError::NotOpen {
            handle: Handle::new(3),
        };
        assert_eq!(err.to_string(), "Data store 3 is not open for access");
        assert_eq!(err.fault_type(), FAULT_TYPE_ACCESS);

        let err: AccessError = HandleError::NotFound {
            table: "data",
            handle: Handle::new(9),
        }
        .into();
        assert_eq!(err.fault_type(), FAULT_TYPE_LOOKUP_MISS);
    }
}
