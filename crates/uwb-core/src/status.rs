//! UCI status codes and device status values

use std::fmt;

/// Status byte carried in the first payload byte of every UCI response
/// and in generic error notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UciStatus {
    Ok,
    Rejected,
    Failed,
    SyntaxError,
    InvalidParam,
    InvalidRange,
    InvalidMessageSize,
    UnknownGid,
    UnknownOid,
    ReadOnly,
    /// Device asks the host to resend the last command
    CommandRetry,
    /// Reserved or vendor-specific status
    Unknown(u8),
}

impl UciStatus {
    /// Raw status byte
    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn is_ok(self) -> bool {
        self == UciStatus::Ok
    }

    /// True when the device asked for the command to be resent
    pub fn is_retry(self) -> bool {
        self == UciStatus::CommandRetry
    }
}

impl From<u8> for UciStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Rejected,
            0x02 => Self::Failed,
            0x03 => Self::SyntaxError,
            0x04 => Self::InvalidParam,
            0x05 => Self::InvalidRange,
            0x06 => Self::InvalidMessageSize,
            0x07 => Self::UnknownGid,
            0x08 => Self::UnknownOid,
            0x09 => Self::ReadOnly,
            0x0A => Self::CommandRetry,
            other => Self::Unknown(other),
        }
    }
}

impl From<UciStatus> for u8 {
    fn from(status: UciStatus) -> Self {
        match status {
            UciStatus::Ok => 0x00,
            UciStatus::Rejected => 0x01,
            UciStatus::Failed => 0x02,
            UciStatus::SyntaxError => 0x03,
            UciStatus::InvalidParam => 0x04,
            UciStatus::InvalidRange => 0x05,
            UciStatus::InvalidMessageSize => 0x06,
            UciStatus::UnknownGid => 0x07,
            UciStatus::UnknownOid => 0x08,
            UciStatus::ReadOnly => 0x09,
            UciStatus::CommandRetry => 0x0A,
            UciStatus::Unknown(code) => code,
        }
    }
}

impl fmt::Display for UciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UciStatus::Ok => "ok",
            UciStatus::Rejected => "rejected",
            UciStatus::Failed => "failed",
            UciStatus::SyntaxError => "syntax error",
            UciStatus::InvalidParam => "invalid parameter",
            UciStatus::InvalidRange => "invalid range",
            UciStatus::InvalidMessageSize => "invalid message size",
            UciStatus::UnknownGid => "unknown group id",
            UciStatus::UnknownOid => "unknown opcode id",
            UciStatus::ReadOnly => "read only",
            UciStatus::CommandRetry => "command retry",
            UciStatus::Unknown(_) => "unknown status",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// Controller state reported by CORE_DEVICE_STATUS_NTF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Init,
    Ready,
    Active,
    /// Wakeup from hard power-down (low power mode exit)
    HdpWakeup,
    Error,
    Unknown(u8),
}

impl DeviceStatus {
    pub fn code(self) -> u8 {
        self.into()
    }
}

impl From<u8> for DeviceStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Init,
            0x01 => Self::Ready,
            0x02 => Self::Active,
            0xFC => Self::HdpWakeup,
            0xFF => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl From<DeviceStatus> for u8 {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Init => 0x00,
            DeviceStatus::Ready => 0x01,
            DeviceStatus::Active => 0x02,
            DeviceStatus::HdpWakeup => 0xFC,
            DeviceStatus::Error => 0xFF,
            DeviceStatus::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Init => "init",
            DeviceStatus::Ready => "ready",
            DeviceStatus::Active => "active",
            DeviceStatus::HdpWakeup => "hdp wakeup",
            DeviceStatus::Error => "error",
            DeviceStatus::Unknown(_) => "unknown",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_through_u8() {
        for code in 0u8..=0x0B {
            assert_eq!(u8::from(UciStatus::from(code)), code);
        }
        assert_eq!(UciStatus::from(0x0A), UciStatus::CommandRetry);
        assert_eq!(UciStatus::from(0x52), UciStatus::Unknown(0x52));
    }

    #[test]
    fn test_device_status_wakeup_and_error() {
        assert_eq!(DeviceStatus::from(0xFC), DeviceStatus::HdpWakeup);
        assert_eq!(DeviceStatus::from(0xFF), DeviceStatus::Error);
        assert_eq!(DeviceStatus::Unknown(0x7E).code(), 0x7E);
    }
}
