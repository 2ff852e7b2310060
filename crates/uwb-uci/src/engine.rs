//! Owned engine session composing channel, retry and lifecycle

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uwb_core::{gid, oid, EventId, Response, UciError, UciResult, UciStatus};

use crate::bus::{create_bus, BusIo};
use crate::channel::{ChannelStats, CommandChannel};
use crate::config::EngineConfig;
use crate::events::Callbacks;
use crate::firmware::FirmwareImage;
use crate::lifecycle::{DeviceLifecycle, DeviceState};
use crate::retry::RetryController;

/// Decoded CORE_DEVICE_INFO response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub uci_version: u16,
    pub mac_version: u16,
    pub phy_version: u16,
    pub test_version: u16,
    pub vendor: Bytes,
}

impl DeviceInfo {
    /// Parse the response body (after the status byte)
    pub fn parse(body: &Bytes) -> UciResult<Self> {
        if body.len() < 8 {
            return Err(UciError::InvalidFrame(format!(
                "device info needs 8 bytes, got {}",
                body.len()
            )));
        }
        let word = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
        let vendor = match body.get(8) {
            Some(&len) => {
                let end = 9 + len as usize;
                if body.len() < end {
                    return Err(UciError::InvalidFrame(
                        "device info vendor field truncated".to_string(),
                    ));
                }
                body.slice(9..end)
            }
            None => Bytes::new(),
        };
        Ok(Self {
            uci_version: word(0),
            mac_version: word(2),
            phy_version: word(4),
            test_version: word(6),
            vendor,
        })
    }
}

pub struct UciEngine {
    config: EngineConfig,
    channel: Arc<CommandChannel>,
    retry: Arc<RetryController>,
    lifecycle: DeviceLifecycle,
}

impl UciEngine {
    pub fn new(bus: Arc<dyn BusIo>, config: EngineConfig) -> Self {
        let channel = Arc::new(CommandChannel::new(
            bus,
            config.transport.clone(),
            config.channel.clone(),
        ));
        let retry = Arc::new(RetryController::new(channel.clone(), config.retry.clone()));
        let lifecycle = DeviceLifecycle::new(
            retry.clone(),
            config.lifecycle.clone(),
            config.firmware.clone(),
        );
        Self {
            config,
            channel,
            retry,
            lifecycle,
        }
    }

    /// Build the engine over the bus named in the configuration
    pub fn from_config(config: EngineConfig) -> UciResult<Self> {
        let bus = create_bus(&config.bus)?;
        Ok(Self::new(bus, config))
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn retry(&self) -> &Arc<RetryController> {
        &self.retry
    }

    pub fn state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Open the channel and arm the continuous read
    pub async fn open(&self, callbacks: Callbacks) -> UciResult<()> {
        let was_open = self.channel.is_open();
        self.channel.open(callbacks).await?;
        if was_open {
            return Ok(());
        }
        let armed = self.channel.read(
            self.config.transport.max_frame_len,
            Arc::new(|result| {
                match result {
                    Ok(_) | Err(UciError::Aborted) => {}
                    Err(e @ UciError::BusTimeout(_)) => debug!(error = %e, "Idle read timed out"),
                    Err(e) => warn!(error = %e, "Read failed"),
                }
            }),
        );
        match armed {
            Ok(()) | Err(UciError::ReadBusy) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn close(&self) -> UciResult<()> {
        self.channel.close().await
    }

    /// Run device bring-up, downloading the configured firmware if any
    pub async fn initialize(&self) -> UciResult<()> {
        let image = match &self.config.firmware.path {
            Some(path) => Some(FirmwareImage::load(path)?),
            None => None,
        };
        self.initialize_with(image.as_ref()).await
    }

    /// Run device bring-up with an explicit firmware image
    pub async fn initialize_with(&self, image: Option<&FirmwareImage>) -> UciResult<()> {
        self.lifecycle.initialize(image).await
    }

    /// Send a command once the device is operational
    pub async fn send_command(
        &self,
        gid: u8,
        oid: u8,
        payload: impl Into<Bytes>,
    ) -> UciResult<Response> {
        if self.state() != DeviceState::Operational {
            return Err(UciError::NotInitialized);
        }
        self.retry.send(gid, oid, payload).await
    }

    pub async fn core_get_device_info(&self) -> UciResult<DeviceInfo> {
        let response = self
            .send_command(gid::CORE, oid::core::DEVICE_INFO, Bytes::new())
            .await?;
        let info = DeviceInfo::parse(&response.body)?;
        info!(
            uci = %format!("{:#06x}", info.uci_version),
            mac = %format!("{:#06x}", info.mac_version),
            phy = %format!("{:#06x}", info.phy_version),
            "Device info"
        );
        Ok(info)
    }

    pub async fn core_device_reset(&self) -> UciResult<()> {
        self.send_command(gid::CORE, oid::core::DEVICE_RESET, vec![0x00])
            .await
            .map(|_| ())
    }

    /// Set device configuration parameters given as (id, value) pairs
    pub async fn core_set_config(&self, tlvs: &[(u8, Vec<u8>)]) -> UciResult<()> {
        let count = u8::try_from(tlvs.len())
            .map_err(|_| UciError::InvalidFrame("too many configuration parameters".to_string()))?;
        let mut payload = vec![count];
        for (id, value) in tlvs {
            let len = u8::try_from(value.len()).map_err(|_| {
                UciError::InvalidFrame(format!("parameter 0x{:02X} value too long", id))
            })?;
            payload.push(*id);
            payload.push(len);
            payload.extend_from_slice(value);
        }

        let response = self
            .send_command(gid::CORE, oid::core::SET_CONFIG, payload)
            .await?;
        // Body lists parameters the device refused as (id, status) pairs
        if let Some(&failed) = response.body.first() {
            if failed > 0 {
                let status = response
                    .body
                    .get(2)
                    .copied()
                    .map(UciStatus::from)
                    .unwrap_or(UciStatus::Failed);
                return Err(UciError::CommandFailed {
                    event: EventId::new(gid::CORE, oid::core::SET_CONFIG),
                    status,
                });
            }
        }
        Ok(())
    }
}
