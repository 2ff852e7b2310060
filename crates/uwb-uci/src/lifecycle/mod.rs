//! Device bring-up state machine
//!
//! ```text
//! INIT ─► FW_DOWNLOAD ─► {INIT | READY} ─► CONFIGURE ─► RESET ─► READY ─► OPERATIONAL
//!   └──────────────────────────┘ (no image)
//!
//! ERROR          from any state, on a device status notification
//! LOW_POWER_WAKEUP  from OPERATIONAL, back on READY
//! ```
//!
//! Every stage waits a bounded time for its device status; a missed
//! status fails initialization and is not retried here.

mod state;

pub use state::{DeviceState, DeviceTracker};

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uwb_core::{gid, oid, DeviceStatus, UciError, UciResult};

use crate::channel::{CommandChannel, ResetLevel};
use crate::config::{FirmwareConfig, LifecycleConfig};
use crate::events::EngineEvent;
use crate::firmware::{FirmwareImage, FirmwareLoader};
use crate::monitor::{WaitOutcome, Waiter};
use crate::retry::RetryController;

pub struct DeviceLifecycle {
    retry: Arc<RetryController>,
    config: LifecycleConfig,
    firmware: FirmwareConfig,
}

impl DeviceLifecycle {
    pub fn new(retry: Arc<RetryController>, config: LifecycleConfig, firmware: FirmwareConfig) -> Self {
        Self {
            retry,
            config,
            firmware,
        }
    }

    fn channel(&self) -> &Arc<CommandChannel> {
        self.retry.channel()
    }

    pub fn state(&self) -> DeviceState {
        self.channel().tracker().state()
    }

    async fn enter(&self, to: DeviceState) {
        let from = self.channel().tracker().set_state(to);
        if from != to {
            self.channel()
                .emit(EngineEvent::StateChanged { from, to })
                .await;
        }
    }

    /// Bring the device from power-up to OPERATIONAL
    pub async fn initialize(&self, image: Option<&FirmwareImage>) -> UciResult<()> {
        let channel = self.channel();
        if !channel.is_open() {
            return Err(UciError::NotInitialized);
        }
        let tracker = channel.tracker();
        tracker.reset();
        self.enter(DeviceState::Init).await;

        let boot = tracker.arm(
            channel.monitor(),
            &[DeviceStatus::Init, DeviceStatus::Ready],
            false,
        )?;
        channel.reset(ResetLevel::Pulse(self.config.reset_pulse())).await;

        if let Some(image) = image {
            self.enter(DeviceState::FwDownload).await;
            let loader = FirmwareLoader::new(self.retry.clone(), &self.firmware);
            loader.download(image).await?;
        }

        let status = await_status(boot, self.config.boot_timeout(), "boot").await?;
        info!(%status, "Device booted");

        self.enter(DeviceState::Configuring).await;
        for cmd in &self.config.board_config {
            let payload = cmd
                .payload_bytes()
                .map_err(|e| UciError::InvalidFrame(e.to_string()))?;
            self.retry.send(cmd.gid, cmd.oid, payload).await?;
        }
        info!(commands = self.config.board_config.len(), "Board configuration applied");

        self.enter(DeviceState::Resetting).await;
        let ready = tracker.arm(channel.monitor(), &[DeviceStatus::Ready], false)?;
        self.retry
            .send(gid::CORE, oid::core::DEVICE_RESET, vec![0x00])
            .await?;
        await_status(ready, self.config.ready_timeout(), "ready").await?;

        self.enter(DeviceState::Operational).await;
        info!("Device operational");
        Ok(())
    }
}

async fn await_status(
    waiter: Waiter,
    timeout: Duration,
    stage: &'static str,
) -> UciResult<DeviceStatus> {
    match waiter.wait(timeout).await {
        WaitOutcome::DeviceStatus(status) => Ok(status),
        WaitOutcome::TimedOut => {
            warn!(stage, ?timeout, "Expected device status not received");
            Err(UciError::InitTimeout { stage })
        }
        WaitOutcome::Failed(e) => Err(e),
        other => {
            warn!(stage, outcome = ?other, "Unexpected outcome for device status wait");
            Err(UciError::InitTimeout { stage })
        }
    }
}
