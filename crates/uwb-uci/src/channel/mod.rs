//! Command channel: the one logical connection to the controller
//!
//! # Architecture
//!
//! ```text
//!  caller ── write / send_and_wait ──► TransportFramer ──► BusIo
//!                   │                                        │
//!            PendingCommand (≤ 1)                            │
//!                   ▲                                        ▼
//!                   └──── reader (blocking worker) ◄── read_frame
//!                                   │
//!                     DispatchMessage (bounded mpsc)
//!                                   ▼
//!                   dispatcher task ──► read callback / on_event / on_data
//! ```
//!
//! At most one command is outstanding. A second command while one is
//! pending is rejected with [`UciError::Busy`] before anything reaches
//! the bus.

mod dispatch;
mod reader;
mod slot;

pub use dispatch::DispatchMessage;
pub use slot::ReadCallback;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uwb_core::{EventId, Frame, FramingMode, MessageType, UciError, UciResult};

use crate::bus::{BusIo, Level, Pin};
use crate::codec::header::UciHeader;
use crate::codec::{CodecError, TransportContext, TransportFramer};
use crate::config::{ChannelConfig, TransportConfig};
use crate::events::{Callbacks, EngineEvent};
use crate::lifecycle::DeviceTracker;
use crate::monitor::{ResourceMonitor, WaitOutcome, WaiterId};
use dispatch::Dispatcher;
use slot::SlotCell;

/// What the pending command waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaited {
    /// Response with this group/opcode
    Uci(EventId),
    /// Any bootloader reply
    Bootstrap,
}

/// The single in-flight command
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub(crate) awaited: Awaited,
    /// `None` for raw writes: the response goes to `on_data`
    pub(crate) waiter: Option<WaiterId>,
    pub(crate) since: Instant,
}

/// Chip-enable control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// Hold the controller in reset
    Assert,
    /// Let the controller run
    Release,
    /// Assert, wait, release
    Pulse(Duration),
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub notifications: u64,
    pub protocol_errors: u64,
    pub retries: u64,
    pub opened: u64,
    pub closed: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub(crate) frames_read: AtomicU64,
    pub(crate) frames_written: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) notifications: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) opened: AtomicU64,
    pub(crate) closed: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the reader while open
pub(crate) struct ChannelInner {
    pub(crate) framer: Arc<TransportFramer>,
    pub(crate) slot: Arc<SlotCell>,
    pub(crate) pending: Mutex<Option<PendingCommand>>,
    pub(crate) stop: AtomicBool,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) monitor: Arc<ResourceMonitor>,
    pub(crate) tracker: Arc<DeviceTracker>,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) idle: Duration,
}

struct OpenChannel {
    inner: Arc<ChannelInner>,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

pub struct CommandChannel {
    bus: Arc<dyn BusIo>,
    transport: TransportConfig,
    config: ChannelConfig,
    monitor: Arc<ResourceMonitor>,
    tracker: Arc<DeviceTracker>,
    stats: Arc<StatsCounters>,
    state: Mutex<Option<OpenChannel>>,
}

impl CommandChannel {
    pub fn new(bus: Arc<dyn BusIo>, transport: TransportConfig, config: ChannelConfig) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(config.lock_timeout()));
        Self {
            bus,
            transport,
            config,
            monitor,
            tracker: Arc::new(DeviceTracker::new()),
            stats: Arc::new(StatsCounters::default()),
            state: Mutex::new(None),
        }
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn tracker(&self) -> &Arc<DeviceTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    fn inner(&self) -> UciResult<Arc<ChannelInner>> {
        self.state
            .lock()
            .as_ref()
            .map(|open| open.inner.clone())
            .ok_or(UciError::NotInitialized)
    }

    /// Open the channel and start the reader and dispatcher
    ///
    /// Succeeds without effect when already open.
    pub async fn open(&self, callbacks: Callbacks) -> UciResult<()> {
        let _guard = self.monitor.lock_concurrency().await?;
        if self.is_open() {
            debug!("Channel already open");
            return Ok(());
        }

        self.monitor.init();
        let framer = Arc::new(TransportFramer::new(
            self.bus.clone(),
            self.transport.clone(),
        ));

        if self.config.dispatch_queue_depth == 0 {
            drop(framer);
            self.monitor.teardown();
            return Err(UciError::ResourceCreation(
                "dispatch queue depth must be non-zero".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(self.config.dispatch_queue_depth);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                drop((tx, rx, framer));
                self.monitor.teardown();
                return Err(UciError::ResourceCreation(format!(
                    "no runtime for channel tasks: {}",
                    e
                )));
            }
        };

        let slot = Arc::new(SlotCell::default());
        let inner = Arc::new(ChannelInner {
            framer,
            slot,
            pending: Mutex::new(None),
            stop: AtomicBool::new(false),
            dispatcher: Dispatcher::new(tx),
            monitor: self.monitor.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
            idle: self.config.reader_idle(),
        });

        let dispatcher = runtime.spawn(dispatch::run(rx, callbacks));
        let reader = {
            let inner = inner.clone();
            runtime.spawn_blocking(move || reader::run(inner))
        };

        *self.state.lock() = Some(OpenChannel {
            inner,
            reader,
            dispatcher,
        });
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        info!(queue_depth = self.config.dispatch_queue_depth, "Channel opened");
        Ok(())
    }

    /// Stop the reader, abort any pending read and fail every outstanding wait
    ///
    /// Returns [`UciError::AlreadyClosed`] when not open.
    pub async fn close(&self) -> UciResult<()> {
        let _guard = self.monitor.lock_concurrency().await?;
        let open = self.state.lock().take().ok_or(UciError::AlreadyClosed)?;
        let OpenChannel {
            inner,
            reader,
            dispatcher,
        } = open;

        inner.stop.store(true, Ordering::SeqCst);
        match inner.slot.abort() {
            Some(callback) => {
                inner
                    .dispatcher
                    .post(DispatchMessage::ReadComplete {
                        callback,
                        result: Err(UciError::Aborted),
                    })
                    .await
            }
            None => inner.slot.wake(),
        }

        if let Some(pending) = inner.pending.lock().take() {
            debug!(awaited = ?pending.awaited, "Dropping pending command at close");
        }
        self.tracker.clear_waits();
        self.monitor.teardown();

        let timeout = self.config.close_timeout();
        if tokio::time::timeout(timeout, reader).await.is_err() {
            warn!(?timeout, "Reader did not stop in time");
        }

        inner.dispatcher.post(DispatchMessage::Event(EngineEvent::Closed)).await;
        inner.dispatcher.post(DispatchMessage::Shutdown).await;
        if tokio::time::timeout(timeout, dispatcher).await.is_err() {
            warn!(?timeout, "Dispatcher did not stop in time");
        }

        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        let stats = self.stats();
        info!(
            frames_read = stats.frames_read,
            frames_written = stats.frames_written,
            notifications = stats.notifications,
            protocol_errors = stats.protocol_errors,
            retries = stats.retries,
            "Channel closed"
        );
        Ok(())
    }

    /// Transmit one frame; returns the number of bytes accepted
    ///
    /// A command frame opens the command window. The response is delivered
    /// to `on_data`. With no response the window stays closed to other
    /// commands for the configured response timeout, then the next command
    /// replaces it.
    pub async fn write(&self, bytes: &[u8]) -> UciResult<usize> {
        let inner = self.inner()?;
        let _guard = self.monitor.lock_concurrency().await?;
        self.write_locked(&inner, bytes, None).await
    }

    /// Transmit a command and wait for its response
    pub async fn send_and_wait(&self, bytes: &[u8], timeout: Duration) -> UciResult<Frame> {
        let inner = self.inner()?;
        let waiter = self.monitor.register()?;
        let id = waiter.id();
        {
            let _guard = self.monitor.lock_concurrency().await?;
            self.write_locked(&inner, bytes, Some(id)).await?;
        }

        match waiter.wait(timeout).await {
            WaitOutcome::Response(frame) => Ok(frame),
            WaitOutcome::RetryRequested => Err(UciError::RetryRequested),
            WaitOutcome::TimedOut => {
                self.clear_pending_for(&inner, id);
                Err(UciError::Timeout)
            }
            WaitOutcome::Failed(e) => {
                self.clear_pending_for(&inner, id);
                Err(e)
            }
            WaitOutcome::DeviceStatus(status) => Err(UciError::InvalidFrame(format!(
                "device status {} delivered to a command wait",
                status
            ))),
        }
    }

    async fn write_locked(
        &self,
        inner: &Arc<ChannelInner>,
        bytes: &[u8],
        waiter: Option<WaiterId>,
    ) -> UciResult<usize> {
        let mode = inner.framer.mode();
        let awaited = match mode {
            FramingMode::Uci => {
                let header = UciHeader::parse(bytes).map_err(UciError::from)?;
                (header.message_type == MessageType::Command)
                    .then(|| Awaited::Uci(EventId::new(header.gid, header.oid)))
            }
            FramingMode::Hbci | FramingMode::Hdll => Some(Awaited::Bootstrap),
        };

        if waiter.is_some() && awaited.is_none() {
            return Err(UciError::InvalidFrame(
                "only commands can wait for a response".to_string(),
            ));
        }

        if let Some(awaited) = awaited {
            let mut pending = inner.pending.lock();
            let expired = pending.as_ref().is_some_and(|current| {
                current.waiter.is_none()
                    && current.since.elapsed() >= self.config.response_timeout()
            });
            if expired {
                if let Some(stale) = pending.take() {
                    debug!(awaited = ?stale.awaited, "Unanswered raw command expired");
                }
            }
            if let Some(current) = pending.as_ref() {
                debug!(
                    current = ?current.awaited,
                    elapsed = ?current.since.elapsed(),
                    "Command rejected, window busy"
                );
                return Err(UciError::Busy);
            }
            *pending = Some(PendingCommand {
                awaited,
                waiter,
                since: Instant::now(),
            });
        }

        let result = self.transmit(inner, bytes.to_vec()).await;
        if result.is_err() && awaited.is_some() {
            inner.pending.lock().take();
        }
        result
    }

    async fn transmit(&self, inner: &Arc<ChannelInner>, bytes: Vec<u8>) -> UciResult<usize> {
        let framer = inner.framer.clone();
        let stats = self.stats.clone();
        let retry_delay = self.transport.write_retry_delay();

        // Only a write that put nothing on the bus is safe to resend
        let result = tokio::task::spawn_blocking(move || {
            match framer.write_frame(&bytes) {
                Err(CodecError::Bus(e)) => {
                    warn!(error = %e, "Write failed, retrying once");
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(retry_delay);
                    framer.write_frame(&bytes)
                }
                other => other,
            }
        })
        .await
        .map_err(|e| UciError::ResourceCreation(format!("write task failed: {}", e)))?;

        let written = result.map_err(UciError::from)?;
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn clear_pending_for(&self, inner: &ChannelInner, id: WaiterId) {
        let mut pending = inner.pending.lock();
        if pending.as_ref().and_then(|p| p.waiter) == Some(id) {
            pending.take();
        }
    }

    /// Arm the asynchronous read
    ///
    /// Once armed, every completion re-arms with the same capacity until
    /// the read is aborted or the channel closes.
    pub fn read(&self, capacity: usize, callback: ReadCallback) -> UciResult<()> {
        let inner = self.inner()?;
        inner.slot.arm(capacity, callback)
    }

    /// Disarm the read; returns true if one was pending
    pub async fn abort_read(&self) -> UciResult<bool> {
        let inner = self.inner()?;
        let Some(callback) = inner.slot.abort() else {
            return Ok(false);
        };
        inner
            .dispatcher
            .post(DispatchMessage::ReadComplete {
                callback,
                result: Err(UciError::Aborted),
            })
            .await;
        Ok(true)
    }

    pub fn is_read_pending(&self) -> bool {
        self.inner()
            .map(|inner| inner.slot.is_busy())
            .unwrap_or(false)
    }

    /// True while a command waits for its response
    pub fn has_pending(&self) -> bool {
        self.inner()
            .map(|inner| inner.pending.lock().is_some())
            .unwrap_or(false)
    }

    /// Discard the pending command; a registered waiter times out
    pub fn flush_pending(&self) -> bool {
        let Ok(inner) = self.inner() else {
            return false;
        };
        let pending = inner.pending.lock().take();
        match pending {
            Some(pending) => {
                debug!(awaited = ?pending.awaited, "Flushing pending command");
                if let Some(id) = pending.waiter {
                    self.monitor.release(id, WaitOutcome::TimedOut);
                }
                true
            }
            None => false,
        }
    }

    pub fn set_mode(&self, mode: FramingMode) -> UciResult<()> {
        self.inner()?.framer.set_mode(mode);
        Ok(())
    }

    pub fn mode(&self) -> UciResult<FramingMode> {
        Ok(self.inner()?.framer.mode())
    }

    pub fn transport_context(&self) -> UciResult<TransportContext> {
        Ok(self.inner()?.framer.context())
    }

    /// Drive the chip-enable line
    pub async fn reset(&self, level: ResetLevel) {
        match level {
            ResetLevel::Assert => self.bus.gpio_set(Pin::ChipEnable, Level::Low),
            ResetLevel::Release => self.bus.gpio_set(Pin::ChipEnable, Level::High),
            ResetLevel::Pulse(width) => {
                debug!(?width, "Pulsing chip enable");
                self.bus.gpio_set(Pin::ChipEnable, Level::Low);
                tokio::time::sleep(width).await;
                self.bus.gpio_set(Pin::ChipEnable, Level::High);
            }
        }
    }

    /// Queue an event for `on_event`
    pub async fn emit(&self, event: EngineEvent) {
        if let Ok(inner) = self.inner() {
            inner.dispatcher.post(DispatchMessage::Event(event)).await;
        }
    }

    pub(crate) fn record_retry(&self) {
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Some(open) = self.state.get_mut().take() {
            open.inner.stop.store(true, Ordering::SeqCst);
            open.inner.slot.abort();
            self.monitor.teardown();
        }
    }
}
