//! Simulated UWB controller for testing and hardware-less runs
//!
//! Clones share one device, so a test can keep a handle to script replies
//! and inspect traffic while the engine owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use uwb_core::{gid, oid, DeviceStatus, EventId, FramingMode, MessageType, Packet, UciStatus};

use super::{BusError, BusIo, Level, Pin};
use crate::codec::header::{self, HEADER_LEN};
use crate::config::SimulatedBusConfig;

/// Delay between a reset or download and the boot notification
const BOOT_DELAY: Duration = Duration::from_millis(5);

/// Scripted device reaction to one host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Response with this status byte followed by `payload`
    Respond { status: u8, payload: Vec<u8> },
    /// No reaction at all
    Silent,
    /// Generic error notification asking for the command to be resent
    RetryNtf,
    /// Arbitrary raw frames instead of a response
    Frames(Vec<Vec<u8>>),
    /// The inner reply, emitted after a delay
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Reply::Respond {
            status: UciStatus::Ok.code(),
            payload: payload.into(),
        }
    }

    pub fn status(status: UciStatus) -> Self {
        Reply::Respond {
            status: status.code(),
            payload: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Outbound {
    bytes: Vec<u8>,
    ready_at: Instant,
}

#[derive(Debug)]
struct SimState {
    outbound: VecDeque<Outbound>,
    /// Frame being clocked out and the next byte offset
    current: Option<(Vec<u8>, usize)>,
    /// A frame was read under ready-sync; IRQ stays low until sync drops
    awaiting_sync_release: bool,
    irq_override: Option<Level>,
    ready_sync: Level,
    chip_enable: Level,
    host_buf: Vec<u8>,
    scripted: HashMap<EventId, VecDeque<Reply>>,
    sticky: HashMap<EventId, Reply>,
    transmitted: Vec<Vec<u8>>,
    fail_tx: u32,
    fail_rx: u32,
    /// Firmware runs; otherwise the bootloader speaks HDLL
    running: bool,
    boot_from_flash: bool,
    ready_after_reset: bool,
    device_info: Vec<u8>,
    firmware: Vec<u8>,
    chunks: usize,
    reject_chunk: Option<usize>,
}

impl SimState {
    fn irq_level(&self, now: Instant) -> Level {
        if let Some(level) = self.irq_override {
            return level;
        }
        if self.awaiting_sync_release {
            return Level::Low;
        }
        let pending = self.current.is_some()
            || self
                .outbound
                .front()
                .map(|f| f.ready_at <= now)
                .unwrap_or(false);
        if pending {
            Level::High
        } else {
            Level::Low
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        if self.current.is_some() {
            return None;
        }
        self.outbound.front().map(|f| f.ready_at)
    }

    fn queue(&mut self, bytes: Vec<u8>, delay: Duration) {
        self.outbound.push_back(Outbound {
            bytes,
            ready_at: Instant::now() + delay,
        });
    }

    fn queue_packet(&mut self, packet: &Packet, delay: Duration) {
        match header::encode_packet(packet) {
            Ok(bytes) => self.queue(bytes, delay),
            Err(e) => debug!(error = %e, "Simulated device dropped an unencodable packet"),
        }
    }

    fn queue_status(&mut self, status: DeviceStatus, delay: Duration) {
        let ntf = Packet::notification(gid::CORE, oid::core::DEVICE_STATUS, vec![status.code()]);
        self.queue_packet(&ntf, delay);
    }

    fn mode(&self) -> FramingMode {
        if self.running {
            FramingMode::Uci
        } else {
            FramingMode::Hdll
        }
    }

    fn power_cycle(&mut self) {
        self.outbound.clear();
        self.current = None;
        self.awaiting_sync_release = false;
        self.host_buf.clear();
        self.running = self.boot_from_flash;
        if self.running {
            self.queue_status(DeviceStatus::Init, BOOT_DELAY);
        } else {
            self.firmware.clear();
            self.chunks = 0;
        }
        debug!(running = self.running, "Simulated device reset");
    }

    /// Consume complete frames from the host reassembly buffer
    fn absorb_host_bytes(&mut self) {
        loop {
            let mode = self.mode();
            let Ok(len) = header::frame_len(mode, &self.host_buf) else {
                return;
            };
            if self.host_buf.len() < len {
                return;
            }
            let frame: Vec<u8> = self.host_buf.drain(..len).collect();
            self.transmitted.push(frame.clone());
            match mode {
                FramingMode::Uci => self.handle_uci(&frame),
                FramingMode::Hbci | FramingMode::Hdll => self.handle_hdll(&frame),
            }
        }
    }

    fn handle_uci(&mut self, frame: &[u8]) {
        let packet = match header::decode(FramingMode::Uci, frame) {
            Ok(f) => match f.as_packet() {
                Some(p) => p.clone(),
                None => return,
            },
            Err(e) => {
                debug!(error = %e, "Simulated device ignored malformed frame");
                return;
            }
        };
        if packet.message_type != MessageType::Command {
            return;
        }

        let event = packet.event_id();
        let reply = self
            .scripted
            .get_mut(&event)
            .and_then(|q| q.pop_front())
            .or_else(|| self.sticky.get(&event).cloned())
            .unwrap_or_else(|| self.default_reply(event));
        self.apply_reply(event, reply, Duration::ZERO);
    }

    fn default_reply(&self, event: EventId) -> Reply {
        if event == EventId::new(gid::CORE, oid::core::DEVICE_INFO) {
            Reply::ok(self.device_info.clone())
        } else {
            Reply::ok(Vec::new())
        }
    }

    fn apply_reply(&mut self, event: EventId, reply: Reply, delay: Duration) {
        match reply {
            Reply::Respond { status, payload } => {
                let mut body = vec![status];
                body.extend_from_slice(&payload);
                self.queue_packet(&Packet::response(event.gid, event.oid, body), delay);

                let is_reset = event == EventId::new(gid::CORE, oid::core::DEVICE_RESET);
                if is_reset && status == UciStatus::Ok.code() && self.ready_after_reset {
                    self.queue_status(DeviceStatus::Ready, delay + BOOT_DELAY);
                }
            }
            Reply::Silent => {}
            Reply::RetryNtf => {
                let ntf = Packet::notification(
                    gid::CORE,
                    oid::core::GENERIC_ERROR,
                    vec![UciStatus::CommandRetry.code()],
                );
                self.queue_packet(&ntf, delay);
            }
            Reply::Frames(frames) => {
                for frame in frames {
                    self.queue(frame, delay);
                }
            }
            Reply::Delayed(extra, inner) => self.apply_reply(event, *inner, delay + extra),
        }
    }

    fn handle_hdll(&mut self, frame: &[u8]) {
        let Ok(head) = <[u8; HEADER_LEN]>::try_from(&frame[..HEADER_LEN]) else {
            return;
        };
        let index = self.chunks;
        self.chunks += 1;

        let status = if self.reject_chunk == Some(index) { 0x01 } else { 0x00 };
        let ack = header::hdll_frame(false, 0x00, head[3], vec![status]);
        if let Ok(bytes) = header::encode_bootstrap(&ack) {
            self.queue(bytes, Duration::ZERO);
        }
        if status != 0 {
            return;
        }

        self.firmware.extend_from_slice(&frame[HEADER_LEN..]);
        if !header::hdll_more_chunks(&head) {
            debug!(
                bytes = self.firmware.len(),
                chunks = self.chunks,
                "Simulated device booting downloaded firmware"
            );
            self.running = true;
            self.queue_status(DeviceStatus::Init, BOOT_DELAY);
        }
    }
}

struct Shared {
    state: Mutex<SimState>,
    signal: Condvar,
}

/// In-process controller implementing [`BusIo`]
#[derive(Clone)]
pub struct SimulatedDevice {
    shared: Arc<Shared>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedBusConfig) -> Self {
        let device_info = hex::decode(config.device_info.trim()).unwrap_or_default();
        Self::with_device_info(config, device_info)
    }

    /// Build from configuration, rejecting a malformed device info string
    pub fn from_config(config: &SimulatedBusConfig) -> Result<Self, BusError> {
        let device_info = hex::decode(config.device_info.trim())
            .map_err(|e| BusError::Io(format!("invalid simulated device info: {}", e)))?;
        Ok(Self::with_device_info(config.clone(), device_info))
    }

    fn with_device_info(config: SimulatedBusConfig, device_info: Vec<u8>) -> Self {
        let state = SimState {
            outbound: VecDeque::new(),
            current: None,
            awaiting_sync_release: false,
            irq_override: None,
            ready_sync: Level::Low,
            chip_enable: Level::High,
            host_buf: Vec::new(),
            scripted: HashMap::new(),
            sticky: HashMap::new(),
            transmitted: Vec::new(),
            fail_tx: 0,
            fail_rx: 0,
            running: !config.bootloader,
            boot_from_flash: !config.bootloader,
            ready_after_reset: config.ready_after_reset,
            device_info,
            firmware: Vec::new(),
            chunks: 0,
            reject_chunk: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                signal: Condvar::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let result = f(&mut self.shared.state.lock());
        self.shared.signal.notify_all();
        result
    }

    /// Queue one reply for the next command with this group/opcode
    pub fn push_reply(&self, gid: u8, oid: u8, reply: Reply) {
        self.with_state(|s| {
            s.scripted
                .entry(EventId::new(gid, oid))
                .or_default()
                .push_back(reply)
        });
    }

    /// Reply used for every command with this group/opcode once the
    /// one-shot queue is empty
    pub fn set_reply(&self, gid: u8, oid: u8, reply: Reply) {
        self.with_state(|s| {
            s.sticky.insert(EventId::new(gid, oid), reply);
        });
    }

    /// Queue a raw frame for the host
    pub fn inject_raw(&self, bytes: Vec<u8>) {
        self.with_state(|s| s.queue(bytes, Duration::ZERO));
    }

    /// Queue a UCI notification for the host
    pub fn inject_notification(&self, gid: u8, oid: u8, payload: impl Into<Vec<u8>>) {
        let packet = Packet::notification(gid, oid, payload.into());
        self.with_state(|s| s.queue_packet(&packet, Duration::ZERO));
    }

    /// Queue a CORE_DEVICE_STATUS notification for the host
    pub fn inject_device_status(&self, status: DeviceStatus) {
        self.with_state(|s| s.queue_status(status, Duration::ZERO));
    }

    /// Fail the next `count` transmit calls
    pub fn fail_next_tx(&self, count: u32) {
        self.with_state(|s| s.fail_tx = count);
    }

    /// Fail the next `count` receive calls
    pub fn fail_next_rx(&self, count: u32) {
        self.with_state(|s| s.fail_rx = count);
    }

    /// Pin the IRQ line to a level regardless of pending data
    pub fn force_irq(&self, level: Option<Level>) {
        self.with_state(|s| s.irq_override = level);
    }

    /// Bootloader answers this chunk index with a non-zero status
    pub fn reject_chunk(&self, index: usize) {
        self.with_state(|s| s.reject_chunk = Some(index));
    }

    /// Every complete frame the host has transmitted
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().transmitted.clone()
    }

    /// Number of commands sent with this group/opcode
    pub fn command_count(&self, gid: u8, oid: u8) -> usize {
        self.shared
            .state
            .lock()
            .transmitted
            .iter()
            .filter_map(|f| header::UciHeader::parse(f).ok())
            .filter(|h| h.message_type == MessageType::Command && h.gid == gid && h.oid == oid)
            .count()
    }

    /// Firmware bytes accepted by the bootloader since the last reset
    pub fn firmware_received(&self) -> Vec<u8> {
        self.shared.state.lock().firmware.clone()
    }

    pub fn is_running_firmware(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Frames queued for the host and not yet read
    pub fn pending_frames(&self) -> usize {
        let state = self.shared.state.lock();
        state.outbound.len() + usize::from(state.current.is_some())
    }

    pub fn pin_level(&self, pin: Pin) -> Level {
        let state = self.shared.state.lock();
        match pin {
            Pin::Irq => state.irq_level(Instant::now()),
            Pin::ReadySync => state.ready_sync,
            Pin::ChipEnable => state.chip_enable,
        }
    }
}

impl BusIo for SimulatedDevice {
    fn tx(&self, bytes: &[u8]) -> Result<(), BusError> {
        self.with_state(|s| {
            if s.fail_tx > 0 {
                s.fail_tx -= 1;
                return Err(BusError::Io("injected transmit failure".to_string()));
            }
            s.host_buf.extend_from_slice(bytes);
            s.absorb_host_bytes();
            Ok(())
        })
    }

    fn rx(&self, buf: &mut [u8]) -> Result<(), BusError> {
        self.with_state(|s| {
            if s.fail_rx > 0 {
                s.fail_rx -= 1;
                return Err(BusError::Io("injected receive failure".to_string()));
            }
            if s.current.is_none() {
                let Some(next) = s.outbound.pop_front() else {
                    return Err(BusError::Io("no data pending".to_string()));
                };
                s.current = Some((next.bytes, 0));
            }
            let Some((frame, offset)) = s.current.as_mut() else {
                return Err(BusError::Io("no data pending".to_string()));
            };
            let end = *offset + buf.len();
            if end > frame.len() {
                return Err(BusError::Io(format!(
                    "read of {} bytes past end of {}-byte frame",
                    buf.len(),
                    frame.len()
                )));
            }
            buf.copy_from_slice(&frame[*offset..end]);
            *offset = end;
            if end == frame.len() {
                s.current = None;
                s.awaiting_sync_release = s.ready_sync.is_high();
            }
            Ok(())
        })
    }

    fn gpio_get(&self, pin: Pin) -> Level {
        self.pin_level(pin)
    }

    fn gpio_set(&self, pin: Pin, level: Level) {
        self.with_state(|s| match pin {
            Pin::Irq => {}
            Pin::ReadySync => {
                s.ready_sync = level;
                if level == Level::Low {
                    s.awaiting_sync_release = false;
                }
            }
            Pin::ChipEnable => {
                let rising = s.chip_enable == Level::Low && level == Level::High;
                s.chip_enable = level;
                if rising {
                    s.power_cycle();
                }
            }
        });
    }

    fn wait_irq(&self, timeout: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            let now = Instant::now();
            if state.irq_level(now).is_high() {
                return Ok(());
            }
            if now >= deadline {
                return Err(BusError::Timeout("IRQ not asserted".to_string()));
            }
            // Wake for a delayed frame even if nobody signals
            let wake = match state.next_ready_at() {
                Some(at) if at > now && state.irq_override.is_none() => at.min(deadline),
                _ => deadline,
            };
            self.shared.signal.wait_until(&mut state, wake);
        }
    }
}
