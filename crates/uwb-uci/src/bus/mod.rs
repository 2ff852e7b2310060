//! Bus I/O layer
//!
//! The engine talks to the controller through a small synchronous
//! capability: byte transmit/receive plus three GPIO lines. Register-level
//! SPI/I2C drivers implement [`BusIo`] outside this crate; the in-process
//! [`sim::SimulatedDevice`] implements it for tests and for running the
//! daemon without hardware.
//!
//! # Example
//!
//! ```ignore
//! use uwb_uci::bus::{create_bus, BusIo, Pin};
//! use uwb_uci::config::BusConfig;
//!
//! let bus = create_bus(&BusConfig::default())?;
//! bus.wait_irq(Duration::from_millis(100))?;
//! ```

pub mod error;
pub mod sim;

pub use error::BusError;
pub use sim::{Reply, SimulatedDevice};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BusConfig;

/// GPIO lines shared between host and controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// Controller to host: data is pending
    Irq,
    /// Host to controller: host is ready to clock a frame out
    ReadySync,
    /// Host to controller: chip enable, pulsed to reset
    ChipEnable,
}

/// Logic level of a GPIO line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => f.write_str("low"),
            Level::High => f.write_str("high"),
        }
    }
}

/// Synchronous bus capability
///
/// All methods block the calling thread. Implementations synchronize
/// internally so one instance can be shared between the reader task and
/// command writers.
pub trait BusIo: Send + Sync {
    /// Transmit bytes to the controller
    fn tx(&self, bytes: &[u8]) -> Result<(), BusError>;

    /// Receive exactly `buf.len()` bytes from the controller
    fn rx(&self, buf: &mut [u8]) -> Result<(), BusError>;

    /// Sample a GPIO line
    fn gpio_get(&self, pin: Pin) -> Level;

    /// Drive a GPIO line
    fn gpio_set(&self, pin: Pin, level: Level);

    /// Block until the IRQ line is asserted or `timeout` elapses
    fn wait_irq(&self, timeout: Duration) -> Result<(), BusError>;
}

/// Create a bus based on configuration
pub fn create_bus(config: &BusConfig) -> Result<Arc<dyn BusIo>, BusError> {
    match config {
        BusConfig::Simulated(cfg) => {
            let device = SimulatedDevice::from_config(cfg)?;
            Ok(Arc::new(device))
        }
    }
}
