//! uwb-core - Wire-level types shared by the UWB UCI engine
//!
//! This crate holds the protocol vocabulary (message types, group/opcode
//! identifiers, status codes, framing modes) and the error taxonomy used by
//! every layer of the engine. It performs no I/O.

pub mod error;
pub mod mode;
pub mod packet;
pub mod status;

pub use error::{ErrorCategory, UciError, UciResult};
pub use mode::FramingMode;
pub use packet::{
    gid, oid, BootstrapFrame, EventId, Frame, MessageType, Packet, Response, UCI_HEADER_LEN,
};
pub use status::{DeviceStatus, UciStatus};
