//! The single outstanding asynchronous read

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uwb_core::{Frame, UciError, UciResult};

/// Completion callback for [`super::CommandChannel::read`]
pub type ReadCallback = Arc<dyn Fn(UciResult<Frame>) + Send + Sync>;

#[derive(Default)]
struct ReadSlot {
    capacity: usize,
    callback: Option<ReadCallback>,
    busy: bool,
    enabled: bool,
}

/// Read slot plus the signal the reader idles on
#[derive(Default)]
pub(crate) struct SlotCell {
    slot: Mutex<ReadSlot>,
    signal: Condvar,
}

impl SlotCell {
    pub(crate) fn arm(&self, capacity: usize, callback: ReadCallback) -> UciResult<()> {
        let mut slot = self.slot.lock();
        if slot.busy {
            return Err(UciError::ReadBusy);
        }
        slot.capacity = capacity;
        slot.callback = Some(callback);
        slot.busy = true;
        slot.enabled = true;
        drop(slot);
        self.signal.notify_all();
        Ok(())
    }

    /// Capacity of the armed read, waiting up to `idle` for one
    pub(crate) fn wait_armed(&self, idle: Duration) -> Option<usize> {
        let mut slot = self.slot.lock();
        if !slot.enabled {
            self.signal.wait_for(&mut slot, idle);
        }
        slot.enabled.then_some(slot.capacity)
    }

    /// Callback for a read that just finished; the slot stays armed with
    /// the same capacity. `None` when the read was aborted meanwhile, in
    /// which case the completion must not be delivered.
    pub(crate) fn completion(&self) -> Option<ReadCallback> {
        let slot = self.slot.lock();
        if slot.enabled && slot.busy {
            slot.callback.clone()
        } else {
            None
        }
    }

    /// Disarm; returns the callback of the read that was pending
    pub(crate) fn abort(&self) -> Option<ReadCallback> {
        let mut slot = self.slot.lock();
        let was_busy = slot.busy;
        slot.busy = false;
        slot.enabled = false;
        let callback = slot.callback.take();
        drop(slot);
        self.signal.notify_all();
        callback.filter(|_| was_busy)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.slot.lock().busy
    }

    /// Wake the reader without changing the slot
    pub(crate) fn wake(&self) {
        self.signal.notify_all();
    }
}
