//! Decoded protocol frames
//!
//! A UCI control packet on the wire:
//!
//! ```text
//! byte 0: MT(3) | PBF(1) | GID(4)
//! byte 1: EXT(1) | RFU(1) | OID(6)
//! byte 2: RFU, or length MSB when EXT is set / MT is data
//! byte 3: length, or length LSB when EXT is set / MT is data
//! ```
//!
//! Bootstrap (HBCI/HDLL) frames have their own 4-byte header and are kept
//! opaque apart from the payload length.

use std::fmt;

use bytes::Bytes;

use crate::mode::FramingMode;
use crate::status::UciStatus;

/// Length of every header handled by the engine, in all framing modes
pub const UCI_HEADER_LEN: usize = 4;

/// UCI Group Identifiers
pub mod gid {
    pub const CORE: u8 = 0x00;
    pub const SESSION_CONFIG: u8 = 0x01;
    pub const SESSION_CONTROL: u8 = 0x02;
    pub const DATA_CONTROL: u8 = 0x03;
    pub const TEST: u8 = 0x0D;
    pub const PROPRIETARY: u8 = 0x0E;
    pub const VENDOR: u8 = 0x0F;
}

/// UCI Opcode Identifiers, per group
pub mod oid {
    /// Core group (GID 0x00)
    pub mod core {
        pub const DEVICE_RESET: u8 = 0x00;
        pub const DEVICE_STATUS: u8 = 0x01;
        pub const DEVICE_INFO: u8 = 0x02;
        pub const GET_CAPS_INFO: u8 = 0x03;
        pub const SET_CONFIG: u8 = 0x04;
        pub const GET_CONFIG: u8 = 0x05;
        pub const GENERIC_ERROR: u8 = 0x07;
    }

    /// Session configuration group (GID 0x01)
    pub mod session_config {
        pub const INIT: u8 = 0x00;
        pub const DEINIT: u8 = 0x01;
        pub const STATUS: u8 = 0x02;
    }

    /// Session control group (GID 0x02)
    pub mod session_control {
        pub const START: u8 = 0x00;
        pub const STOP: u8 = 0x01;
        pub const DATA_CREDIT: u8 = 0x04;
    }
}

/// Message type field (MT) of a UCI header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data,
    Command,
    Response,
    Notification,
    /// MT values 4..=7 (test and proprietary use)
    Reserved(u8),
}

impl MessageType {
    /// Decode the 3-bit MT field
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Self::Data,
            1 => Self::Command,
            2 => Self::Response,
            3 => Self::Notification,
            other => Self::Reserved(other),
        }
    }

    /// The 3-bit MT field value
    pub fn bits(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Command => 1,
            Self::Response => 2,
            Self::Notification => 3,
            Self::Reserved(bits) => bits & 0x07,
        }
    }
}

/// Group/opcode pair identifying a command and its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub gid: u8,
    pub oid: u8,
}

impl EventId {
    pub const fn new(gid: u8, oid: u8) -> Self {
        Self { gid, oid }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid 0x{:02X}/oid 0x{:02X}", self.gid, self.oid)
    }
}

/// One decoded UCI packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_type: MessageType,
    /// Packet boundary flag: set when more segments of the message follow
    pub pbf: bool,
    pub gid: u8,
    pub oid: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(message_type: MessageType, gid: u8, oid: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            pbf: false,
            gid,
            oid,
            payload: payload.into(),
        }
    }

    pub fn command(gid: u8, oid: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Command, gid, oid, payload)
    }

    pub fn response(gid: u8, oid: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Response, gid, oid, payload)
    }

    pub fn notification(gid: u8, oid: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Notification, gid, oid, payload)
    }

    pub fn event_id(&self) -> EventId {
        EventId::new(self.gid, self.oid)
    }

    pub fn is_command(&self) -> bool {
        self.message_type == MessageType::Command
    }

    pub fn is_response(&self) -> bool {
        self.message_type == MessageType::Response
    }

    pub fn is_notification(&self) -> bool {
        self.message_type == MessageType::Notification
    }

    /// Status byte of a response or status-carrying notification
    pub fn status(&self) -> Option<UciStatus> {
        self.payload.first().copied().map(UciStatus::from)
    }
}

/// Response to a command, split into status and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub event: EventId,
    pub status: UciStatus,
    /// Payload following the status byte
    pub body: Bytes,
}

impl Response {
    /// Build from a response packet; `None` when the payload lacks a status byte
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let status = packet.status()?;
        Some(Self {
            event: packet.event_id(),
            status,
            body: packet.payload.slice(1..),
        })
    }
}

/// Frame exchanged with the bootloader in HBCI or HDLL mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFrame {
    pub mode: FramingMode,
    pub header: [u8; UCI_HEADER_LEN],
    pub payload: Bytes,
}

impl BootstrapFrame {
    /// Bootloader status, carried in the first payload byte of replies
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Anything the framer can hand to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Uci(Packet),
    Bootstrap(BootstrapFrame),
}

impl Frame {
    pub fn as_packet(&self) -> Option<&Packet> {
        match self {
            Frame::Uci(packet) => Some(packet),
            Frame::Bootstrap(_) => None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Frame::Uci(packet) => &packet.payload,
            Frame::Bootstrap(frame) => &frame.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_bits() {
        assert_eq!(MessageType::from_bits(1), MessageType::Command);
        assert_eq!(MessageType::from_bits(3), MessageType::Notification);
        assert_eq!(MessageType::from_bits(6), MessageType::Reserved(6));
        assert_eq!(MessageType::Response.bits(), 2);
    }

    #[test]
    fn test_response_splits_status_from_body() {
        let packet = Packet::response(gid::CORE, oid::core::DEVICE_INFO, vec![0x00, 0x11, 0x22]);
        let response = Response::from_packet(&packet).unwrap();

        assert_eq!(response.status, UciStatus::Ok);
        assert_eq!(&response.body[..], &[0x11, 0x22]);
        assert_eq!(response.event, EventId::new(0x00, 0x02));
    }

    #[test]
    fn test_response_without_status_byte() {
        let packet = Packet::response(gid::CORE, oid::core::DEVICE_INFO, Vec::new());
        assert!(Response::from_packet(&packet).is_none());
    }
}
