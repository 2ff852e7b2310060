//! Engine locks and the registry of outstanding waits
//!
//! Two locks guard the public surface: the concurrency lock serializes
//! `open`, `close` and `write`; the reentrance lock is held for a whole
//! command transaction so a completion callback calling back into the
//! engine gets [`UciError::Busy`] instead of deadlocking.
//!
//! Every wait on a response or a device status registers a [`Waiter`].
//! Teardown force-releases all of them with [`UciError::Aborted`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, warn};
use uwb_core::{DeviceStatus, Frame, UciError, UciResult};

/// Identifies one registered wait
pub type WaiterId = u64;

/// Terminal result delivered to a waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Response(Frame),
    DeviceStatus(DeviceStatus),
    /// Device asked for the command to be sent again
    RetryRequested,
    TimedOut,
    Failed(UciError),
}

type Registry = Arc<Mutex<Option<HashMap<WaiterId, oneshot::Sender<WaitOutcome>>>>>;

/// Lifetime counters of registered waits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaiterStats {
    pub created: u64,
    pub retired: u64,
    pub force_released: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    retired: AtomicU64,
    force_released: AtomicU64,
}

pub struct ResourceMonitor {
    reentrance: AsyncMutex<()>,
    concurrency: AsyncMutex<()>,
    lock_timeout: Duration,
    registry: Registry,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl ResourceMonitor {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            reentrance: AsyncMutex::new(()),
            concurrency: AsyncMutex::new(()),
            lock_timeout,
            registry: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Acquire the concurrency lock, failing after the configured bound
    pub async fn lock_concurrency(&self) -> UciResult<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.lock_timeout, self.concurrency.lock())
            .await
            .map_err(|_| {
                warn!(timeout = ?self.lock_timeout, "Concurrency lock not acquired");
                UciError::LockTimeout("concurrency")
            })
    }

    /// Take the reentrance lock if no transaction holds it
    pub fn try_lock_reentrance(&self) -> UciResult<MutexGuard<'_, ()>> {
        self.reentrance.try_lock().map_err(|_| UciError::Busy)
    }

    /// Make the registry available; called at open
    pub fn init(&self) {
        let mut registry = self.registry.lock();
        if registry.is_none() {
            *registry = Some(HashMap::new());
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry.lock().is_some()
    }

    /// Register a new wait
    pub fn register(&self) -> UciResult<Waiter> {
        let mut registry = self.registry.lock();
        let waiters = registry
            .as_mut()
            .ok_or_else(|| UciError::ResourceCreation("wait registry is torn down".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.insert(id, tx);
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        Ok(Waiter {
            id,
            rx,
            registry: self.registry.clone(),
            counters: self.counters.clone(),
        })
    }

    /// Deliver an outcome to one waiter; false if it is no longer registered
    pub fn release(&self, id: WaiterId, outcome: WaitOutcome) -> bool {
        let sender = self
            .registry
            .lock()
            .as_mut()
            .and_then(|waiters| waiters.remove(&id));
        match sender {
            Some(tx) => {
                self.counters.retired.fetch_add(1, Ordering::Relaxed);
                tx.send(outcome).is_ok()
            }
            None => false,
        }
    }

    /// Fail every registered waiter with [`UciError::Aborted`]
    pub fn force_release_all(&self) -> usize {
        let drained: Vec<_> = match self.registry.lock().as_mut() {
            Some(waiters) => waiters.drain().collect(),
            None => return 0,
        };
        let count = drained.len();
        for (id, tx) in drained {
            debug!(waiter = id, "Force-releasing waiter");
            let _ = tx.send(WaitOutcome::Failed(UciError::Aborted));
        }
        let count64 = count as u64;
        self.counters.retired.fetch_add(count64, Ordering::Relaxed);
        self.counters.force_released.fetch_add(count64, Ordering::Relaxed);
        count
    }

    /// Release all waiters and drop the registry; called at close
    pub fn teardown(&self) -> usize {
        let released = self.force_release_all();
        *self.registry.lock() = None;
        if released > 0 {
            warn!(released, "Outstanding waits aborted at teardown");
        }
        released
    }

    /// Number of waits currently registered
    pub fn outstanding(&self) -> usize {
        self.registry.lock().as_ref().map(HashMap::len).unwrap_or(0)
    }

    pub fn stats(&self) -> WaiterStats {
        WaiterStats {
            created: self.counters.created.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            force_released: self.counters.force_released.load(Ordering::Relaxed),
        }
    }
}

/// One registered wait; unregisters itself when dropped
pub struct Waiter {
    id: WaiterId,
    rx: oneshot::Receiver<WaitOutcome>,
    registry: Registry,
    counters: Arc<Counters>,
}

impl Waiter {
    pub fn id(&self) -> WaiterId {
        self.id
    }

    /// Wait for the outcome, bounded by `timeout`
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::Failed(UciError::Aborted),
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let removed = self
            .registry
            .lock()
            .as_mut()
            .and_then(|waiters| waiters.remove(&self.id));
        if removed.is_some() {
            self.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
    }
}
