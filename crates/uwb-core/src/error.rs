//! Error taxonomy for the UCI engine

use thiserror::Error;

use crate::packet::EventId;
use crate::status::UciStatus;

/// Result type for engine operations
pub type UciResult<T> = Result<T, UciError>;

/// Errors surfaced by the engine to its callers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UciError {
    // ---- Transport -------------------------------------------------------
    /// Bus transfer failed
    #[error("Bus failure: {0}")]
    BusFailure(String),

    /// Bus did not signal within the allowed time
    #[error("Bus timeout: {0}")]
    BusTimeout(String),

    /// Frame does not fit the caller's buffer
    #[error("Buffer too small: frame needs {required} bytes, capacity is {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    /// Bytes handed to the engine do not form a valid frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // ---- Protocol --------------------------------------------------------
    /// Response group/opcode differs from the command that was sent
    #[error("Response mismatch: expected {expected}, got {actual}")]
    ResponseMismatch { expected: EventId, actual: EventId },

    /// Notification with an unknown group/opcode or malformed payload
    #[error("Unrecognized notification: {0}")]
    UnrecognizedNotification(EventId),

    /// Device asked for the command to be sent again
    #[error("Command retry requested by device")]
    RetryRequested,

    /// Device rejected the command
    #[error("Command {event} rejected: {status}")]
    Rejected { event: EventId, status: UciStatus },

    /// Device answered with a non-success status
    #[error("Command {event} failed: {status}")]
    CommandFailed { event: EventId, status: UciStatus },

    /// All attempts used up; carries the last failure for diagnostics
    #[error("Command {event} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        event: EventId,
        attempts: u32,
        last: Box<UciError>,
    },

    /// No response within the command window
    #[error("Response timeout")]
    Timeout,

    /// Another command is outstanding
    #[error("Busy: a command is already outstanding")]
    Busy,

    /// A read is already armed
    #[error("Read already pending")]
    ReadBusy,

    /// Firmware download rejected by the bootloader
    #[error("Firmware chunk {chunk} rejected with status 0x{status:02X}")]
    FirmwareRejected { chunk: usize, status: u8 },

    // ---- Lifecycle -------------------------------------------------------
    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Engine already open")]
    AlreadyOpen,

    #[error("Engine already closed")]
    AlreadyClosed,

    /// Device reported ERROR status
    #[error("Device reported an error status")]
    DeviceError,

    /// Expected device status notification never arrived
    #[error("Initialization timed out waiting for {stage}")]
    InitTimeout { stage: &'static str },

    // ---- Resource --------------------------------------------------------
    /// Queue, task, or wait-handle could not be created
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// Lock not acquired within the configured bound
    #[error("Timed out acquiring {0} lock")]
    LockTimeout(&'static str),

    /// Wait handle force-released during shutdown
    #[error("Wait aborted by engine shutdown")]
    Aborted,
}

/// Coarse classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Lifecycle,
    Resource,
}

impl UciError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UciError::BusFailure(_)
            | UciError::BusTimeout(_)
            | UciError::BufferTooSmall { .. }
            | UciError::InvalidFrame(_) => ErrorCategory::Transport,
            UciError::ResponseMismatch { .. }
            | UciError::UnrecognizedNotification(_)
            | UciError::RetryRequested
            | UciError::Rejected { .. }
            | UciError::CommandFailed { .. }
            | UciError::RetriesExhausted { .. }
            | UciError::Timeout
            | UciError::Busy
            | UciError::ReadBusy
            | UciError::FirmwareRejected { .. } => ErrorCategory::Protocol,
            UciError::NotInitialized
            | UciError::AlreadyOpen
            | UciError::AlreadyClosed
            | UciError::DeviceError
            | UciError::InitTimeout { .. } => ErrorCategory::Lifecycle,
            UciError::ResourceCreation(_) | UciError::LockTimeout(_) | UciError::Aborted => {
                ErrorCategory::Resource
            }
        }
    }

    /// Raw device status behind this error, if any
    pub fn status(&self) -> Option<UciStatus> {
        match self {
            UciError::Rejected { status, .. } | UciError::CommandFailed { status, .. } => {
                Some(*status)
            }
            UciError::RetryRequested => Some(UciStatus::CommandRetry),
            UciError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_error_exposes_last_status() {
        let err = UciError::RetriesExhausted {
            event: EventId::new(0, 4),
            attempts: 3,
            last: Box::new(UciError::CommandFailed {
                event: EventId::new(0, 4),
                status: UciStatus::Unknown(0xF2),
            }),
        };

        assert_eq!(err.status(), Some(UciStatus::Unknown(0xF2)));
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(UciError::Aborted.category(), ErrorCategory::Resource);
        assert_eq!(UciError::AlreadyClosed.category(), ErrorCategory::Lifecycle);
        assert_eq!(
            UciError::BufferTooSmall {
                required: 14,
                capacity: 4
            }
            .category(),
            ErrorCategory::Transport
        );
    }
}
