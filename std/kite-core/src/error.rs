///
/// Core error types.
///

use thiserror::Error;

use crate::exception::{FAULT_TYPE_INVALID_STATE, FAULT_TYPE_UNKNOWN};
use crate::transfer::TransferRejection;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Illegal transfer state: {0}")]
    InvalidState(TransferRejection),

    #[error("Unknown transfer mode {0}")]
    UnknownTransferMode(i32),
}

impl CoreError {
    pub fn fault_type(&self) -> i64 {
        match self {
            CoreError::InvalidState(_) => FAULT_TYPE_INVALID_STATE,
            CoreError::UnknownTransferMode(_) => FAULT_TYPE_UNKNOWN,
        }
    }
}
