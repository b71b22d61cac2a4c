///
/// Handle table error types.
///

use thiserror::Error;

use kite_core::{FAULT_TYPE_LOOKUP_MISS, FAULT_TYPE_UNKNOWN};

use crate::handle::Handle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("No entry for handle {handle} in the {table} table")]
    NotFound { table: &'static str, handle: Handle },

    #[error("The {table} table has handed out every available handle")]
    Exhausted { table: &'static str },

    #[error("Handle {handle} in the {table} table is already installed")]
    AlreadyInstalled { table: &'static str, handle: Handle },

    #[error("Handle {handle} was never reserved in the {table} table")]
    NotReserved { table: &'static str, handle: Handle },
}

impl HandleError {
    pub fn fault_type(&self) -> i64 {
        match self {
            HandleError::NotFound { .. } | HandleError::NotReserved { .. } => FAULT_TYPE_LOOKUP_MISS,
            HandleError::Exhausted { .. } | HandleError::AlreadyInstalled { .. } => FAULT_TYPE_UNKNOWN,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HandleError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = HandleError::NotFound {
            table: "result",
            handle: Handle::new(12),
        };
        assert!(err.to_string().contains("No entry for handle 12"));
        assert!(err.to_string().contains("result"));
        assert_eq!(err.fault_type(), FAULT_TYPE_LOOKUP_MISS);

        let err = HandleError::Exhausted { table: "pointer" };
        assert!(err.to_string().contains("every available handle"));

        let err = HandleError::AlreadyInstalled {
            table: "database",
            handle: Handle::new(3),
        };
        assert!(err.to_string().contains("already installed"));
    }
}
