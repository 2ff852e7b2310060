//! uwb-uci - UCI protocol engine for UWB controllers
//!
//! This crate provides the host-side engine that exchanges commands,
//! responses and notifications with a UWB controller over a byte bus,
//! including bootloader framing for firmware download.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        UciEngine                            │
//! │                                                             │
//! │  ┌──────────────────┐     ┌───────────────────────────────┐ │
//! │  │ DeviceLifecycle  │────►│ RetryController               │ │
//! │  │ (bring-up state) │     │ (bounded retry, backoff)      │ │
//! │  └────────┬─────────┘     └───────────────┬───────────────┘ │
//! │           │ FirmwareLoader                │                 │
//! │           └───────────────┐               │                 │
//! │                     ┌─────┴───────────────┴─────┐           │
//! │                     │      CommandChannel       │           │
//! │                     │ reader · dispatcher · ≤1  │           │
//! │                     │ pending · ResourceMonitor │           │
//! │                     └─────────────┬─────────────┘           │
//! │                           ┌───────┴────────┐                │
//! │                           │TransportFramer │                │
//! │                           │ UCI/HBCI/HDLL  │                │
//! │                           └───────┬────────┘                │
//! │                           ┌───────┴────────┐                │
//! │                           │     BusIo      │                │
//! │                           │(SPI/I2C/sim)   │                │
//! │                           └────────────────┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod events;
pub mod firmware;
pub mod lifecycle;
pub mod monitor;
pub mod retry;

pub use bus::{create_bus, BusError, BusIo, Level, Pin, Reply, SimulatedDevice};
pub use channel::{ChannelStats, CommandChannel, ReadCallback, ResetLevel};
pub use codec::{CodecError, TransportFramer};
pub use config::{ConfigError, EngineConfig};
pub use engine::{DeviceInfo, UciEngine};
pub use events::{Callbacks, EngineEvent, Notification};
pub use firmware::{FirmwareImage, FirmwareLoader};
pub use lifecycle::{DeviceLifecycle, DeviceState, DeviceTracker};
pub use monitor::{ResourceMonitor, WaitOutcome};
pub use retry::RetryController;

// Re-export for convenience
pub use uwb_core::{
    DeviceStatus, EventId, Frame, FramingMode, MessageType, Packet, Response, UciError,
    UciResult, UciStatus,
};
