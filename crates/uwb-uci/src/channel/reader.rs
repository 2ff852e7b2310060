//! Reader loop and inbound routing
//!
//! Runs on a blocking worker. Frames are processed strictly in arrival
//! order: the armed read completes first, then the frame is routed to the
//! pending command, the notification handler, or the data callback.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use uwb_core::{DeviceStatus, Frame, MessageType, Packet, UciError};

use super::dispatch::DispatchMessage;
use super::{Awaited, ChannelInner};
use crate::codec::CodecError;
use crate::events::{EngineEvent, Notification};
use crate::monitor::WaitOutcome;

pub(crate) fn run(inner: Arc<ChannelInner>) {
    debug!("Reader started");
    while !inner.stop.load(Ordering::SeqCst) {
        let Some(capacity) = inner.slot.wait_armed(inner.idle) else {
            continue;
        };

        let mut buf = vec![0u8; capacity];
        match inner.framer.read_frame(&mut buf, &inner.stop) {
            Ok(frame) => {
                inner.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = inner.slot.completion() {
                    inner.dispatcher.post_blocking(DispatchMessage::ReadComplete {
                        callback,
                        result: Ok(frame.clone()),
                    });
                }
                route(&inner, frame);
            }
            Err(CodecError::Cancelled) => break,
            Err(e) => {
                let err = UciError::from(e);
                debug!(error = %err, "Read failed");
                let bus_fault = matches!(err, UciError::BusFailure(_));
                if let Some(callback) = inner.slot.completion() {
                    inner.dispatcher.post_blocking(DispatchMessage::ReadComplete {
                        callback,
                        result: Err(err),
                    });
                }
                if bus_fault {
                    std::thread::sleep(inner.idle);
                }
            }
        }
    }
    debug!("Reader stopped");
}

fn route(inner: &ChannelInner, frame: Frame) {
    let packet = match &frame {
        Frame::Bootstrap(_) => return route_bootstrap(inner, frame),
        Frame::Uci(packet) => packet.clone(),
    };

    match packet.message_type {
        MessageType::Response => route_response(inner, &packet, frame),
        MessageType::Notification => match Notification::parse(&packet) {
            Some(Ok(notification)) => {
                inner.stats.notifications.fetch_add(1, Ordering::Relaxed);
                handle_notification(inner, notification);
            }
            Some(Err(e)) => {
                inner.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, payload = %hex::encode(&packet.payload), "Malformed notification");
                inner.dispatcher.post_blocking(DispatchMessage::Data(frame));
            }
            None => inner.dispatcher.post_blocking(DispatchMessage::Data(frame)),
        },
        _ => inner.dispatcher.post_blocking(DispatchMessage::Data(frame)),
    }
}

fn route_bootstrap(inner: &ChannelInner, frame: Frame) {
    let pending = {
        let mut pending = inner.pending.lock();
        match pending.as_ref().map(|p| p.awaited) {
            Some(Awaited::Bootstrap) => pending.take(),
            _ => None,
        }
    };
    match pending.and_then(|p| p.waiter) {
        Some(id) => {
            inner.monitor.release(id, WaitOutcome::Response(frame));
        }
        None => inner.dispatcher.post_blocking(DispatchMessage::Data(frame)),
    }
}

fn route_response(inner: &ChannelInner, packet: &Packet, frame: Frame) {
    let actual = packet.event_id();
    let Some(pending) = inner.pending.lock().take() else {
        debug!(event = %actual, "Unsolicited response");
        inner.dispatcher.post_blocking(DispatchMessage::Data(frame));
        return;
    };

    match (pending.awaited, pending.waiter) {
        (Awaited::Uci(expected), Some(id)) if expected == actual => {
            trace!(event = %actual, "Response matched pending command");
            inner.monitor.release(id, WaitOutcome::Response(frame));
        }
        (Awaited::Uci(expected), None) if expected == actual => {
            inner.dispatcher.post_blocking(DispatchMessage::Data(frame));
        }
        (awaited, waiter) => {
            inner.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
            warn!(?awaited, %actual, "Response does not match pending command");
            let expected = match awaited {
                Awaited::Uci(event) => event,
                Awaited::Bootstrap => actual,
            };
            let err = UciError::ResponseMismatch { expected, actual };
            match waiter {
                Some(id) => {
                    inner.monitor.release(id, WaitOutcome::Failed(err));
                }
                None => inner.dispatcher.post_blocking(DispatchMessage::Data(frame)),
            }
        }
    }
}

fn handle_notification(inner: &ChannelInner, notification: Notification) {
    match notification {
        Notification::DeviceStatus(status) => {
            inner
                .dispatcher
                .post_blocking(DispatchMessage::Event(EngineEvent::DeviceStatus(status)));
            if let Some((from, to)) = inner.tracker.on_device_status(&inner.monitor, status) {
                inner
                    .dispatcher
                    .post_blocking(DispatchMessage::Event(EngineEvent::StateChanged { from, to }));
            }
            if status == DeviceStatus::Error {
                handle_device_error(inner);
            }
        }
        Notification::GenericError(status) if status.is_retry() => {
            let pending = {
                let mut pending = inner.pending.lock();
                match pending.as_ref().and_then(|p| p.waiter) {
                    Some(_) => pending.take(),
                    None => None,
                }
            };
            match pending.and_then(|p| p.waiter) {
                Some(id) => {
                    debug!("Device requested command retry");
                    inner.monitor.release(id, WaitOutcome::RetryRequested);
                }
                None => inner
                    .dispatcher
                    .post_blocking(DispatchMessage::Event(EngineEvent::GenericError(status))),
            }
        }
        other => inner
            .dispatcher
            .post_blocking(DispatchMessage::Event(other.into_event())),
    }
}

/// A pending command absorbs the error as a timeout; otherwise the host
/// is asked to recover
fn handle_device_error(inner: &ChannelInner) {
    let pending = inner.pending.lock().take();
    match pending {
        Some(pending) => {
            warn!(awaited = ?pending.awaited, "Device error while command pending");
            if let Some(id) = pending.waiter {
                inner.monitor.release(id, WaitOutcome::TimedOut);
            }
        }
        None => {
            warn!("Device error with no command pending, requesting recovery");
            inner
                .dispatcher
                .post_blocking(DispatchMessage::Event(EngineEvent::RecoveryRequested));
        }
    }
}
