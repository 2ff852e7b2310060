//! Framing errors

use thiserror::Error;

use uwb_core::UciError;

use crate::bus::BusError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Frame needs {required} bytes, buffer holds {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("Header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error("Declared payload length {declared} does not match {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },

    /// The header went out but the payload transaction failed
    #[error("Frame cut off after {sent} of {total} bytes: {source}")]
    PartialWrite {
        sent: usize,
        total: usize,
        source: BusError,
    },

    #[error("IRQ not asserted after {attempts} waits")]
    IrqTimeout { attempts: u32 },

    #[error("Read cancelled")]
    Cancelled,
}

impl From<CodecError> for UciError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Bus(e) => e.into(),
            CodecError::BufferTooSmall { required, capacity } => {
                UciError::BufferTooSmall { required, capacity }
            }
            CodecError::IrqTimeout { attempts } => {
                UciError::BusTimeout(format!("IRQ not asserted after {} waits", attempts))
            }
            CodecError::Cancelled => UciError::Aborted,
            partial @ CodecError::PartialWrite { .. } => {
                UciError::BusFailure(partial.to_string())
            }
            other => UciError::InvalidFrame(other.to_string()),
        }
    }
}
