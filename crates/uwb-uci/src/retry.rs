//! Bounded retry around one command transaction

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};
use uwb_core::{EventId, Frame, Packet, Response, UciError, UciResult, UciStatus};

use crate::channel::CommandChannel;
use crate::codec::header;
use crate::config::RetryConfig;
use crate::lifecycle::DeviceState;

/// What to do after one attempt
enum Verdict<T> {
    Done(T),
    Fatal(UciError),
    /// Transient; flush the window and go again
    Retry(UciError),
}

pub struct RetryController {
    channel: Arc<CommandChannel>,
    config: RetryConfig,
    response_timeout: Duration,
}

impl RetryController {
    pub fn new(channel: Arc<CommandChannel>, config: RetryConfig) -> Self {
        let response_timeout = channel.config().response_timeout();
        Self {
            channel,
            config,
            response_timeout,
        }
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Send a UCI command and return its successful response
    ///
    /// Retries on timeout, on a retry request from the device, and on
    /// statuses at or above the severe threshold. A rejected command fails
    /// at once.
    pub async fn send(&self, gid: u8, oid: u8, payload: impl Into<Bytes>) -> UciResult<Response> {
        let event = EventId::new(gid, oid);
        let bytes = header::encode_packet(&Packet::command(gid, oid, payload))?;
        let timeout = self.response_timeout;
        let severe = self.config.severe_status_threshold;

        self.run(event, &bytes, timeout, |frame| {
            let Some(response) = frame.as_packet().and_then(Response::from_packet) else {
                return Verdict::Retry(UciError::InvalidFrame(
                    "response without status byte".to_string(),
                ));
            };
            classify(event, response, severe)
        })
        .await
    }

    /// Send an already-encoded frame and return the raw reply
    ///
    /// Used for bootloader traffic, where the caller interprets the reply.
    pub async fn send_raw(&self, bytes: &[u8], timeout: Duration) -> UciResult<Frame> {
        let event = header::frame_event(self.channel.mode()?, bytes)?;
        self.run(event, bytes, timeout, Verdict::Done).await
    }

    async fn run<T>(
        &self,
        event: EventId,
        bytes: &[u8],
        timeout: Duration,
        judge: impl Fn(Frame) -> Verdict<T>,
    ) -> UciResult<T> {
        let _reentry = self.channel.monitor().try_lock_reentrance()?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut last = UciError::Timeout;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.channel.record_retry();
            }

            if self.channel.tracker().state() == DeviceState::Error {
                warn!(%event, attempt, "Device in error state, backing off");
                self.channel.flush_pending();
                tokio::time::sleep(self.config.backoff()).await;
                last = UciError::DeviceError;
                continue;
            }
            if self.channel.has_pending() {
                warn!(%event, attempt, "Stale command window, flushing");
                self.channel.flush_pending();
                tokio::time::sleep(self.config.backoff()).await;
            }

            let verdict = match self.channel.send_and_wait(bytes, timeout).await {
                Ok(frame) => judge(frame),
                Err(e) => classify_error(e),
            };
            match verdict {
                Verdict::Done(value) => return Ok(value),
                Verdict::Fatal(e) => return Err(e),
                Verdict::Retry(e) => {
                    debug!(%event, attempt, error = %e, "Attempt failed, retrying");
                    self.channel.flush_pending();
                    last = e;
                }
            }
        }

        warn!(%event, attempts = max_attempts, last = %last, "Command failed after retries");
        Err(UciError::RetriesExhausted {
            event,
            attempts: max_attempts,
            last: Box::new(last),
        })
    }
}

fn classify(event: EventId, response: Response, severe: u8) -> Verdict<Response> {
    match response.status {
        UciStatus::Ok => Verdict::Done(response),
        UciStatus::Rejected => Verdict::Fatal(UciError::Rejected {
            event,
            status: response.status,
        }),
        status if status.is_retry() || status.code() >= severe => {
            Verdict::Retry(UciError::CommandFailed { event, status })
        }
        status => Verdict::Fatal(UciError::CommandFailed { event, status }),
    }
}

fn classify_error<T>(err: UciError) -> Verdict<T> {
    match err {
        UciError::Timeout
        | UciError::RetryRequested
        | UciError::BusFailure(_)
        | UciError::BusTimeout(_)
        | UciError::ResponseMismatch { .. } => Verdict::Retry(err),
        other => Verdict::Fatal(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Reply, SimulatedDevice};
    use crate::config::{ChannelConfig, SimulatedBusConfig, TransportConfig};
    use crate::events::Callbacks;

    async fn setup() -> (SimulatedDevice, RetryController) {
        let device = SimulatedDevice::new(SimulatedBusConfig::default());
        let transport = TransportConfig {
            irq_wait_ms: 5,
            write_settle_us: 0,
            ..TransportConfig::default()
        };
        let channel_config = ChannelConfig {
            reader_idle_ms: 5,
            response_timeout_ms: 50,
            ..ChannelConfig::default()
        };
        let channel = Arc::new(CommandChannel::new(
            Arc::new(device.clone()),
            transport,
            channel_config,
        ));
        channel.open(Callbacks::new()).await.unwrap();
        channel.read(512, Arc::new(|_| {})).unwrap();

        let retry = RetryController::new(
            channel,
            RetryConfig {
                backoff_ms: 1,
                ..RetryConfig::default()
            },
        );
        (device, retry)
    }

    #[tokio::test]
    async fn test_retry_status_is_retried_transparently() {
        let (device, retry) = setup().await;
        device.push_reply(0x00, 0x04, Reply::status(UciStatus::CommandRetry));
        device.push_reply(0x00, 0x04, Reply::RetryNtf);

        let response = retry.send(0x00, 0x04, vec![0x00]).await.unwrap();

        assert!(response.status.is_ok());
        assert_eq!(device.command_count(0x00, 0x04), 3);
        assert_eq!(retry.channel().stats().retries, 2);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let (device, retry) = setup().await;
        device.set_reply(0x01, 0x00, Reply::status(UciStatus::Rejected));

        let result = retry.send(0x01, 0x00, vec![0x01, 0x00, 0x00, 0x00, 0x00]).await;

        assert_eq!(
            result.unwrap_err(),
            UciError::Rejected {
                event: EventId::new(0x01, 0x00),
                status: UciStatus::Rejected
            }
        );
        assert_eq!(device.command_count(0x01, 0x00), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_status() {
        let (device, retry) = setup().await;
        device.set_reply(0x00, 0x04, Reply::status(UciStatus::Unknown(0xF3)));

        let err = retry.send(0x00, 0x04, Vec::new()).await.unwrap_err();

        assert!(matches!(err, UciError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(UciStatus::Unknown(0xF3)));
        assert_eq!(device.command_count(0x00, 0x04), 3);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_attempts() {
        let (device, retry) = setup().await;
        device.set_reply(0x00, 0x03, Reply::Silent);

        let err = retry.send(0x00, 0x03, Vec::new()).await.unwrap_err();

        assert_eq!(
            err,
            UciError::RetriesExhausted {
                event: EventId::new(0x00, 0x03),
                attempts: 3,
                last: Box::new(UciError::Timeout),
            }
        );
    }

    #[tokio::test]
    async fn test_ordinary_failure_is_surfaced_without_retry() {
        let (device, retry) = setup().await;
        device.set_reply(0x00, 0x04, Reply::status(UciStatus::InvalidParam));

        let err = retry.send(0x00, 0x04, Vec::new()).await.unwrap_err();

        assert_eq!(err.status(), Some(UciStatus::InvalidParam));
        assert_eq!(device.command_count(0x00, 0x04), 1);
    }

    #[tokio::test]
    async fn test_stale_window_is_flushed_before_sending() {
        let (device, retry) = setup().await;
        device.push_reply(0x00, 0x05, Reply::Silent);
        retry.channel().write(&[0x20, 0x05, 0x00, 0x00]).await.unwrap();
        assert!(retry.channel().has_pending());

        let response = retry.send(0x00, 0x02, Vec::new()).await.unwrap();

        assert!(response.status.is_ok());
        assert_eq!(device.command_count(0x00, 0x02), 1);
    }

    #[tokio::test]
    async fn test_nested_transaction_is_busy() {
        let (_device, retry) = setup().await;
        let _held = retry.channel().monitor().try_lock_reentrance().unwrap();

        assert_eq!(
            retry.send(0x00, 0x02, Vec::new()).await.unwrap_err(),
            UciError::Busy
        );
    }
}
