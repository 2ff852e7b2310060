//! Bus layer errors

use thiserror::Error;

use uwb_core::UciError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus timeout: {0}")]
    Timeout(String),

    #[error("Bus I/O failed: {0}")]
    Io(String),

    #[error("Bus disconnected")]
    Disconnected,
}

impl From<BusError> for UciError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout(msg) => UciError::BusTimeout(msg),
            BusError::Io(msg) => UciError::BusFailure(msg),
            BusError::Disconnected => UciError::BusFailure("disconnected".to_string()),
        }
    }
}
