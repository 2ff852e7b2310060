//! Dispatcher task: runs host callbacks off the reader thread

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uwb_core::{Frame, UciResult};

use super::slot::ReadCallback;
use crate::events::{Callbacks, EngineEvent};

/// Work posted to the dispatcher
pub enum DispatchMessage {
    /// A read finished; `callback` is the one armed when it finished
    ReadComplete {
        callback: ReadCallback,
        result: UciResult<Frame>,
    },
    Event(EngineEvent),
    /// Traffic not consumed by the engine
    Data(Frame),
    Shutdown,
}

impl fmt::Debug for DispatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMessage::ReadComplete { result, .. } => {
                f.debug_struct("ReadComplete").field("result", result).finish()
            }
            DispatchMessage::Event(event) => f.debug_tuple("Event").field(event).finish(),
            DispatchMessage::Data(frame) => f.debug_tuple("Data").field(frame).finish(),
            DispatchMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Sending half shared by the reader and the public API
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<DispatchMessage>,
}

impl Dispatcher {
    pub(crate) fn new(tx: mpsc::Sender<DispatchMessage>) -> Self {
        Self { tx }
    }

    /// Post from async context
    pub(crate) async fn post(&self, msg: DispatchMessage) {
        if let Err(e) = self.tx.send(msg).await {
            debug!(message = ?e.0, "Dispatcher gone, message dropped");
        }
    }

    /// Post from the blocking reader thread
    pub(crate) fn post_blocking(&self, msg: DispatchMessage) {
        if let Err(e) = self.tx.blocking_send(msg) {
            debug!(message = ?e.0, "Dispatcher gone, message dropped");
        }
    }
}

/// Drain the queue until shutdown or until every sender is gone
pub(crate) async fn run(mut rx: mpsc::Receiver<DispatchMessage>, callbacks: Callbacks) {
    debug!("Dispatcher started");
    while let Some(msg) = rx.recv().await {
        match msg {
            DispatchMessage::ReadComplete { callback, result } => {
                trace!(ok = result.is_ok(), "Delivering read completion");
                callback(result);
            }
            DispatchMessage::Event(event) => {
                trace!(?event, "Dispatching event");
                if let Some(cb) = &callbacks.on_event {
                    cb(event);
                }
            }
            DispatchMessage::Data(frame) => {
                if let Some(cb) = &callbacks.on_data {
                    cb(frame);
                }
            }
            DispatchMessage::Shutdown => break,
        }
    }
    debug!("Dispatcher stopped");
}
