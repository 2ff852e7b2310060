//! Integration tests for the UWB UCI engine
//!
//! These tests drive the full stack against the in-process simulated
//! controller:
//! - bus framing and the IRQ/ready-sync handshake
//! - command channel, reader and dispatcher
//! - retry policy and device bring-up, including firmware download
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p uwb-tests
//! ```
//!
//! # Test Structure
//!
//! - `channel_test.rs` - open/close cycles, reads, command window
//! - `lifecycle_test.rs` - bring-up to OPERATIONAL and its failure modes
//! - `retry_test.rs` - retries seen end to end through the engine
//!
//! The helpers below build engines with short timeouts and record what
//! the callbacks deliver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uwb_core::{Frame, UciResult};
use uwb_uci::config::{
    ChannelConfig, EngineConfig, FirmwareConfig, LifecycleConfig, RetryConfig,
    SimulatedBusConfig, TransportConfig,
};
use uwb_uci::{
    Callbacks, CommandChannel, DeviceState, EngineEvent, ReadCallback, SimulatedDevice, UciEngine,
};

/// Engine configuration with timeouts short enough for tests
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        transport: fast_transport(),
        channel: fast_channel(),
        retry: RetryConfig {
            backoff_ms: 1,
            ..RetryConfig::default()
        },
        lifecycle: LifecycleConfig {
            boot_timeout_ms: 200,
            ready_timeout_ms: 200,
            reset_pulse_ms: 1,
            ..LifecycleConfig::default()
        },
        firmware: FirmwareConfig {
            max_chunk_len: 64,
            chunk_timeout_ms: 200,
            ..FirmwareConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        irq_wait_ms: 5,
        irq_wait_attempts: 4,
        write_settle_us: 0,
        ..TransportConfig::default()
    }
}

pub fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        reader_idle_ms: 5,
        response_timeout_ms: 100,
        close_timeout_ms: 1000,
        ..ChannelConfig::default()
    }
}

/// Everything the callbacks delivered, in order
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<EngineEvent>>>,
    data: Arc<Mutex<Vec<Frame>>>,
    reads: Arc<Mutex<Vec<UciResult<Frame>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> Callbacks {
        let events = self.events.clone();
        let data = self.data.clone();
        Callbacks::new()
            .on_event(move |event| events.lock().push(event))
            .on_data(move |frame| data.lock().push(frame))
    }

    pub fn read_callback(&self) -> ReadCallback {
        let reads = self.reads.clone();
        Arc::new(move |result| reads.lock().push(result))
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn data(&self) -> Vec<Frame> {
        self.data.lock().clone()
    }

    pub fn reads(&self) -> Vec<UciResult<Frame>> {
        self.reads.lock().clone()
    }

    /// Targets of every recorded state change
    pub fn states(&self) -> Vec<DeviceState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                EngineEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

/// Engine wired to a simulated device the test keeps a handle to
pub struct Harness {
    pub device: SimulatedDevice,
    pub engine: UciEngine,
    pub recorder: Recorder,
}

impl Harness {
    pub fn new(sim: SimulatedBusConfig) -> Self {
        Self::with_config(sim, fast_config())
    }

    pub fn with_config(sim: SimulatedBusConfig, config: EngineConfig) -> Self {
        let device = SimulatedDevice::new(sim);
        let engine = UciEngine::new(Arc::new(device.clone()), config);
        Self {
            device,
            engine,
            recorder: Recorder::new(),
        }
    }

    pub async fn open(&self) -> UciResult<()> {
        self.engine.open(self.recorder.callbacks()).await
    }

    /// Open and bring the device up from flash
    pub async fn operational(sim: SimulatedBusConfig) -> Self {
        let harness = Self::new(sim);
        harness.open().await.expect("open");
        harness.engine.initialize().await.expect("initialize");
        harness
    }
}

/// Channel over a fresh simulated device, not yet opened
pub fn channel(sim: SimulatedBusConfig) -> (SimulatedDevice, Arc<CommandChannel>) {
    let device = SimulatedDevice::new(sim);
    let channel = Arc::new(CommandChannel::new(
        Arc::new(device.clone()),
        fast_transport(),
        fast_channel(),
    ));
    (device, channel)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Write a firmware image to a temp file
pub fn firmware_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write image");
    file.flush().expect("flush image");
    file
}

/// Encoded UCI command frame from a hex string, e.g. "20020000"
pub fn frame(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).expect("valid hex frame")
}
