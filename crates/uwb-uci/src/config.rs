//! Engine configuration
//!
//! This module contains configuration types for the UCI engine,
//! including bus timing, channel resources, retry policy, lifecycle
//! timeouts, and the board configuration applied during bring-up.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// Framer timing
    #[serde(default)]
    pub transport: TransportConfig,
    /// Command channel resources and timeouts
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Command retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Device bring-up
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Firmware download
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transport.max_frame_len <= uwb_core::UCI_HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "transport.max_frame_len must exceed the {}-byte header",
                uwb_core::UCI_HEADER_LEN
            )));
        }
        if self.firmware.max_chunk_len == 0 || self.firmware.max_chunk_len > 0x1FFF {
            return Err(ConfigError::Invalid(
                "firmware.max_chunk_len must be within 1..=8191".to_string(),
            ));
        }
        for cmd in &self.lifecycle.board_config {
            cmd.payload_bytes()?;
        }
        Ok(())
    }
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// Bus selection
///
/// Physical SPI/I2C drivers implement [`crate::bus::BusIo`] outside this
/// crate; the in-process simulator is selectable from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusConfig {
    /// In-process simulated controller
    Simulated(SimulatedBusConfig),
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::Simulated(SimulatedBusConfig::default())
    }
}

/// Simulated controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedBusConfig {
    /// Start in the bootloader, expecting a firmware download
    #[serde(default)]
    pub bootloader: bool,
    /// Emit READY after a CORE_DEVICE_RESET command
    #[serde(default = "default_true")]
    pub ready_after_reset: bool,
    /// Device info payload returned for CORE_DEVICE_INFO (hex, after status)
    #[serde(default = "default_device_info")]
    pub device_info: String,
}

impl Default for SimulatedBusConfig {
    fn default() -> Self {
        Self {
            bootloader: false,
            ready_after_reset: default_true(),
            device_info: default_device_info(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_device_info() -> String {
    "0001010200020300".to_string()
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Framer timing and bus handshake bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest frame (header + payload) accepted in either direction
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Single wait-for-IRQ slice in milliseconds
    #[serde(default = "default_irq_wait_ms")]
    pub irq_wait_ms: u64,
    /// Number of wait-for-IRQ slices before a read reports a timeout
    #[serde(default = "default_irq_wait_attempts")]
    pub irq_wait_attempts: u32,
    /// Polls for IRQ deassertion after a read
    #[serde(default = "default_irq_release_polls")]
    pub irq_release_polls: u32,
    /// Sleep between IRQ deassertion polls in microseconds
    #[serde(default = "default_irq_release_poll_us")]
    pub irq_release_poll_us: u64,
    /// Send UCI header and payload as two bus transactions
    #[serde(default = "default_true")]
    pub split_header_write: bool,
    /// Settle delay between header and payload transactions in microseconds
    #[serde(default = "default_write_settle_us")]
    pub write_settle_us: u64,
    /// Delay before the single transparent write retry in milliseconds
    #[serde(default = "default_write_retry_delay_ms")]
    pub write_retry_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            irq_wait_ms: default_irq_wait_ms(),
            irq_wait_attempts: default_irq_wait_attempts(),
            irq_release_polls: default_irq_release_polls(),
            irq_release_poll_us: default_irq_release_poll_us(),
            split_header_write: default_true(),
            write_settle_us: default_write_settle_us(),
            write_retry_delay_ms: default_write_retry_delay_ms(),
        }
    }
}

impl TransportConfig {
    pub fn irq_wait(&self) -> Duration {
        Duration::from_millis(self.irq_wait_ms)
    }

    pub fn irq_release_poll(&self) -> Duration {
        Duration::from_micros(self.irq_release_poll_us)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_micros(self.write_settle_us)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

fn default_max_frame_len() -> usize {
    4200
}

fn default_irq_wait_ms() -> u64 {
    100
}

fn default_irq_wait_attempts() -> u32 {
    50
}

fn default_irq_release_polls() -> u32 {
    20
}

fn default_irq_release_poll_us() -> u64 {
    50
}

fn default_write_settle_us() -> u64 {
    100
}

fn default_write_retry_delay_ms() -> u64 {
    1
}

// =============================================================================
// Channel Configuration
// =============================================================================

/// Command channel resources and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of the dispatcher queue
    #[serde(default = "default_dispatch_queue_depth")]
    pub dispatch_queue_depth: usize,
    /// Reader idle wait when no read is armed, in milliseconds
    #[serde(default = "default_reader_idle_ms")]
    pub reader_idle_ms: u64,
    /// Bound on waiting for the reader and dispatcher to stop, in milliseconds
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Bound on acquiring the engine locks, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Command window: time allowed for a response, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dispatch_queue_depth: default_dispatch_queue_depth(),
            reader_idle_ms: default_reader_idle_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn reader_idle(&self) -> Duration {
        Duration::from_millis(self.reader_idle_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_dispatch_queue_depth() -> usize {
    64
}

fn default_reader_idle_ms() -> u64 {
    20
}

fn default_close_timeout_ms() -> u64 {
    2000
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_response_timeout_ms() -> u64 {
    800
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Retry policy for command transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after flushing a stale command window, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Response statuses at or above this value are retried
    #[serde(default = "default_severe_status")]
    pub severe_status_threshold: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            severe_status_threshold: default_severe_status(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    10
}

fn default_severe_status() -> u8 {
    0xF0
}

// =============================================================================
// Lifecycle Configuration
// =============================================================================

/// Device bring-up configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Wait for the boot status (INIT or READY) after power-up or download
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,
    /// Wait for the final READY after the device reset command
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Width of the chip-enable reset pulse, in milliseconds
    #[serde(default = "default_reset_pulse_ms")]
    pub reset_pulse_ms: u64,
    /// UCI commands applied during the CONFIGURE stage
    #[serde(default)]
    pub board_config: Vec<BoardCommand>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            boot_timeout_ms: default_boot_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            reset_pulse_ms: default_reset_pulse_ms(),
            board_config: Vec::new(),
        }
    }
}

impl LifecycleConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }
}

fn default_boot_timeout_ms() -> u64 {
    1000
}

fn default_ready_timeout_ms() -> u64 {
    1000
}

fn default_reset_pulse_ms() -> u64 {
    2
}

/// One UCI command of the board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardCommand {
    pub gid: u8,
    pub oid: u8,
    /// Payload as a hex string (e.g., "01E402010A")
    #[serde(default)]
    pub payload: String,
}

impl BoardCommand {
    /// Decode the hex payload
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        hex::decode(self.payload.trim()).map_err(|e| {
            ConfigError::Invalid(format!(
                "board_config gid 0x{:02X} oid 0x{:02X}: bad payload '{}': {}",
                self.gid, self.oid, self.payload, e
            ))
        })
    }
}

// =============================================================================
// Firmware Configuration
// =============================================================================

/// Firmware download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Firmware image to download during bring-up (none = boot from flash)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Largest HDLL chunk payload
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
    /// Time allowed for each chunk acknowledgement, in milliseconds
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_chunk_len: default_max_chunk_len(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
        }
    }
}

impl FirmwareConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

fn default_max_chunk_len() -> usize {
    256
}

fn default_chunk_timeout_ms() -> u64 {
    500
}
