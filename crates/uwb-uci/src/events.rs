//! Notifications recognized by the engine and events delivered to the host

use std::fmt;
use std::sync::Arc;

use uwb_core::{gid, oid, DeviceStatus, EventId, Frame, Packet, UciError, UciStatus};

use crate::lifecycle::DeviceState;

/// Event delivered to the `on_event` callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Device status notification, as received
    DeviceStatus(DeviceStatus),
    /// Lifecycle state changed
    StateChanged { from: DeviceState, to: DeviceState },
    SessionStatus {
        session_id: u32,
        state: u8,
        reason: u8,
    },
    /// Data transmit credit for a session
    Credit { session_id: u32, available: bool },
    /// Generic error notification not consumed by a pending command
    GenericError(UciStatus),
    /// Device reported ERROR with no command pending
    RecoveryRequested,
    /// Channel closed; last event of an open/close cycle
    Closed,
}

/// Notification kinds routed by the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DeviceStatus(DeviceStatus),
    GenericError(UciStatus),
    SessionStatus {
        session_id: u32,
        state: u8,
        reason: u8,
    },
    Credit { session_id: u32, available: bool },
}

const DEVICE_STATUS: EventId = EventId::new(gid::CORE, oid::core::DEVICE_STATUS);
const GENERIC_ERROR: EventId = EventId::new(gid::CORE, oid::core::GENERIC_ERROR);
const SESSION_STATUS: EventId = EventId::new(gid::SESSION_CONFIG, oid::session_config::STATUS);
const DATA_CREDIT: EventId = EventId::new(gid::SESSION_CONTROL, oid::session_control::DATA_CREDIT);

impl Notification {
    /// Classify a notification packet
    ///
    /// Returns `None` for group/opcode pairs the engine does not route
    /// itself, and an error when a routed kind has a malformed payload.
    pub fn parse(packet: &Packet) -> Option<Result<Self, UciError>> {
        if !packet.is_notification() {
            return None;
        }
        let event = packet.event_id();
        let p = &packet.payload;
        let malformed =
            || -> Result<Self, UciError> { Err(UciError::UnrecognizedNotification(event)) };

        let parsed = match event {
            DEVICE_STATUS => match p.first() {
                Some(&code) => Ok(Notification::DeviceStatus(code.into())),
                None => malformed(),
            },
            GENERIC_ERROR => match p.first() {
                Some(&code) => Ok(Notification::GenericError(code.into())),
                None => malformed(),
            },
            SESSION_STATUS => match p.get(..6) {
                Some(b) => Ok(Notification::SessionStatus {
                    session_id: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    state: b[4],
                    reason: b[5],
                }),
                None => malformed(),
            },
            DATA_CREDIT => match p.get(..5) {
                Some(b) => Ok(Notification::Credit {
                    session_id: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    available: b[4] != 0,
                }),
                None => malformed(),
            },
            _ => return None,
        };
        Some(parsed)
    }

    pub fn into_event(self) -> EngineEvent {
        match self {
            Notification::DeviceStatus(status) => EngineEvent::DeviceStatus(status),
            Notification::GenericError(status) => EngineEvent::GenericError(status),
            Notification::SessionStatus {
                session_id,
                state,
                reason,
            } => EngineEvent::SessionStatus {
                session_id,
                state,
                reason,
            },
            Notification::Credit {
                session_id,
                available,
            } => EngineEvent::Credit {
                session_id,
                available,
            },
        }
    }
}

pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Host callbacks, invoked on the dispatcher task
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_event: Option<EventCallback>,
    pub on_data: Option<DataCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(mut self, f: impl Fn(EngineEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(Frame) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_event", &self.on_event.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status() {
        let packet = Packet::notification(0x00, 0x01, vec![0xFF]);
        assert_eq!(
            Notification::parse(&packet),
            Some(Ok(Notification::DeviceStatus(DeviceStatus::Error)))
        );
    }

    #[test]
    fn test_session_status_little_endian_id() {
        let packet = Packet::notification(0x01, 0x02, vec![0x78, 0x56, 0x34, 0x12, 0x02, 0x00]);
        assert_eq!(
            Notification::parse(&packet),
            Some(Ok(Notification::SessionStatus {
                session_id: 0x1234_5678,
                state: 0x02,
                reason: 0x00
            }))
        );
    }

    #[test]
    fn test_truncated_credit_is_malformed() {
        let packet = Packet::notification(0x02, 0x04, vec![0x01, 0x00]);
        assert_eq!(
            Notification::parse(&packet),
            Some(Err(UciError::UnrecognizedNotification(EventId::new(0x02, 0x04))))
        );
    }

    #[test]
    fn test_other_notifications_are_not_routed() {
        let ranging = Packet::notification(0x02, 0x00, vec![0x00; 8]);
        assert_eq!(Notification::parse(&ranging), None);

        let response = Packet::response(0x00, 0x01, vec![0x00]);
        assert_eq!(Notification::parse(&response), None);
    }
}
