//! Device state tracking driven by status notifications

use std::fmt;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uwb_core::{DeviceStatus, UciError, UciResult};

use crate::monitor::{ResourceMonitor, WaitOutcome, Waiter, WaiterId};

/// Controller lifecycle state as seen by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Init,
    FwDownload,
    Ready,
    Configuring,
    Resetting,
    Operational,
    Error,
    LowPowerWakeup,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Init => "init",
            DeviceState::FwDownload => "fw_download",
            DeviceState::Ready => "ready",
            DeviceState::Configuring => "configuring",
            DeviceState::Resetting => "resetting",
            DeviceState::Operational => "operational",
            DeviceState::Error => "error",
            DeviceState::LowPowerWakeup => "low_power_wakeup",
        };
        f.write_str(s)
    }
}

/// Next state after a device status notification
fn transition(state: DeviceState, status: DeviceStatus) -> DeviceState {
    use DeviceState as S;

    match (status, state) {
        (DeviceStatus::Error, _) => S::Error,
        (DeviceStatus::HdpWakeup, S::Operational) => S::LowPowerWakeup,
        (DeviceStatus::Ready, S::LowPowerWakeup) => S::Operational,
        (DeviceStatus::Ready, S::Init | S::FwDownload | S::Error) => S::Ready,
        // Bring-up stages own their transitions; a reboot elsewhere restarts
        (DeviceStatus::Init, S::FwDownload | S::Configuring | S::Resetting) => state,
        (DeviceStatus::Init, _) => S::Init,
        _ => state,
    }
}

struct StatusWait {
    id: WaiterId,
    expected: Vec<DeviceStatus>,
}

/// Lifecycle state plus armed waits for specific device statuses
#[derive(Default)]
pub struct DeviceTracker {
    state: RwLock<DeviceState>,
    last_status: RwLock<Option<DeviceStatus>>,
    waits: Mutex<Vec<StatusWait>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        *self.last_status.read()
    }

    /// Force a state; returns the previous one
    pub fn set_state(&self, to: DeviceState) -> DeviceState {
        let mut state = self.state.write();
        let from = *state;
        if from != to {
            info!(%from, %to, "Device state changed");
        }
        *state = to;
        from
    }

    /// Arm a wait for one of `expected`
    ///
    /// Arm before triggering the action that produces the status. With
    /// `accept_current`, a matching last status resolves the wait at once.
    pub fn arm(
        &self,
        monitor: &ResourceMonitor,
        expected: &[DeviceStatus],
        accept_current: bool,
    ) -> UciResult<Waiter> {
        let waiter = monitor.register()?;
        let current = self.last_status();

        match current {
            Some(status) if accept_current && expected.contains(&status) => {
                monitor.release(waiter.id(), WaitOutcome::DeviceStatus(status));
            }
            _ => self.waits.lock().push(StatusWait {
                id: waiter.id(),
                expected: expected.to_vec(),
            }),
        }
        Ok(waiter)
    }

    /// Apply a device status notification
    ///
    /// Returns the state change, if any. ERROR fails every armed wait.
    pub fn on_device_status(
        &self,
        monitor: &ResourceMonitor,
        status: DeviceStatus,
    ) -> Option<(DeviceState, DeviceState)> {
        *self.last_status.write() = Some(status);

        let change = {
            let mut state = self.state.write();
            let from = *state;
            let to = transition(from, status);
            *state = to;
            (from != to).then_some((from, to))
        };
        match change {
            Some((from, to)) if to == DeviceState::Error => {
                warn!(%from, %status, "Device entered error state")
            }
            Some((from, to)) => info!(%from, %to, %status, "Device state changed"),
            None => debug!(%status, "Device status without state change"),
        }

        let mut waits = self.waits.lock();
        waits.retain(|wait| {
            if status == DeviceStatus::Error {
                monitor.release(wait.id, WaitOutcome::Failed(UciError::DeviceError));
                false
            } else if wait.expected.contains(&status) {
                monitor.release(wait.id, WaitOutcome::DeviceStatus(status));
                false
            } else {
                true
            }
        });
        change
    }

    /// Drop armed waits; their waiters are failed by the monitor teardown
    pub fn clear_waits(&self) {
        self.waits.lock().clear();
    }

    /// Back to the power-on state
    pub fn reset(&self) {
        *self.state.write() = DeviceState::Init;
        *self.last_status.write() = None;
        self.clear_waits();
    }
}
