//! Command channel behavior over the simulated bus
//!
//! Run with: cargo test -p uwb-tests --test channel_test

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_test::assert_ok;
use uwb_core::{DeviceStatus, FramingMode};
use uwb_tests::{channel, frame, wait_until, Recorder};
use uwb_uci::bus::{Level, Reply};
use uwb_uci::config::SimulatedBusConfig;
use uwb_uci::{EngineEvent, UciError};

const LONG: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_open_close_cycles_balance_resources() {
    let (device, channel) = channel(SimulatedBusConfig::default());

    for cycle in 0..3u8 {
        let recorder = Recorder::new();
        assert_ok!(channel.open(recorder.callbacks()).await);
        assert_ok!(channel.read(256, recorder.read_callback()));

        device.push_reply(0x00, 0x02, Reply::ok(vec![cycle]));
        let response = assert_ok!(channel.send_and_wait(&frame("20020000"), LONG).await);
        assert_eq!(response.payload().as_ref(), &[0x00, cycle]);

        // One silent command left pending across close
        device.push_reply(0x00, 0x05, Reply::Silent);
        assert_ok!(channel.write(&frame("20050000")).await);

        assert_ok!(channel.close().await);
        assert!(!channel.is_open());
        assert!(!channel.has_pending());
    }

    let stats = channel.stats();
    assert_eq!(stats.opened, 3);
    assert_eq!(stats.closed, 3);

    let waits = channel.monitor().stats();
    assert_eq!(waits.created, waits.retired);
    assert_eq!(channel.monitor().outstanding(), 0);
}

#[tokio::test]
async fn test_open_is_idempotent_and_second_close_fails() {
    let (_device, channel) = channel(SimulatedBusConfig::default());

    assert_ok!(channel.open(Recorder::new().callbacks()).await);
    assert_ok!(channel.open(Recorder::new().callbacks()).await);
    assert_ok!(channel.close().await);

    assert_eq!(channel.close().await, Err(UciError::AlreadyClosed));
    assert_eq!(channel.stats().opened, 1);
}

#[tokio::test]
async fn test_close_aborts_pending_read_and_ends_with_closed_event() {
    let (_device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(64, recorder.read_callback()));

    assert_ok!(channel.close().await);

    let aborted = recorder
        .reads()
        .iter()
        .filter(|r| **r == Err(UciError::Aborted))
        .count();
    assert_eq!(aborted, 1);
    assert_eq!(recorder.events().last(), Some(&EngineEvent::Closed));
    assert!(!channel.is_read_pending());
}

#[tokio::test]
async fn test_close_fails_outstanding_command() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    device.set_reply(0x00, 0x04, Reply::Silent);
    assert_ok!(channel.open(Recorder::new().callbacks()).await);
    assert_ok!(channel.read(64, Recorder::new().read_callback()));

    let command = frame("20040000");
    let (result, closed) = tokio::join!(channel.send_and_wait(&command, LONG), async {
        assert!(wait_until(LONG, || channel.has_pending()).await);
        channel.close().await
    });

    assert_eq!(result, Err(UciError::Aborted));
    assert_ok!(closed);
    assert_eq!(channel.monitor().stats().force_released, 1);
}

#[tokio::test]
async fn test_write_while_pending_is_busy_and_not_transmitted() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    device.set_reply(0x00, 0x04, Reply::Silent);
    assert_ok!(channel.open(Recorder::new().callbacks()).await);

    assert_ok!(channel.write(&frame("20040000")).await);
    assert_eq!(
        channel.write(&frame("20020000")).await,
        Err(UciError::Busy)
    );
    assert_eq!(device.transmitted(), vec![frame("20040000")]);

    // Non-command traffic does not touch the command window
    assert_ok!(channel.write(&frame("60010001AA")).await);
    assert_eq!(device.transmitted().len(), 2);

    assert!(channel.flush_pending());
    assert_ok!(channel.write(&frame("20020000")).await);
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_stuck_irq_reports_bus_timeout_then_recovers() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    device.force_irq(Some(Level::Low));
    device.inject_notification(0x02, 0x04, vec![0x01, 0x00, 0x00, 0x00, 0x01]);

    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(64, recorder.read_callback()));

    let reads = recorder.clone();
    assert!(
        wait_until(LONG, || reads
            .reads()
            .iter()
            .any(|r| matches!(r, Err(UciError::BusTimeout(_)))))
        .await
    );
    assert!(channel.is_read_pending());

    device.force_irq(None);
    let events = recorder.clone();
    assert!(
        wait_until(LONG, || events.events().contains(&EngineEvent::Credit {
            session_id: 1,
            available: true
        }))
        .await
    );
    assert!(recorder.reads().iter().any(|r| r.is_ok()));
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_small_read_buffer_reports_required_size() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(4, recorder.read_callback()));

    device.inject_raw(vec![0x62, 0x00, 0x00, 0x06, 1, 2, 3, 4, 5, 6]);

    let reads = recorder.clone();
    assert!(
        wait_until(LONG, || reads.reads().contains(&Err(UciError::BufferTooSmall {
            required: 10,
            capacity: 4
        })))
        .await
    );
    assert_eq!(device.pending_frames(), 0);
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_device_error_resolves_pending_command_as_timeout() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    device.set_reply(0x00, 0x04, Reply::Silent);
    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(64, recorder.read_callback()));

    let command = frame("20040000");
    let started = std::time::Instant::now();
    let (result, _) = tokio::join!(channel.send_and_wait(&command, LONG), async {
        assert!(wait_until(LONG, || channel.has_pending()).await);
        device.inject_device_status(DeviceStatus::Error);
    });

    assert_eq!(result, Err(UciError::Timeout));
    assert!(started.elapsed() < LONG);
    assert!(!channel.has_pending());

    let events = recorder.clone();
    assert!(
        wait_until(LONG, || events
            .events()
            .contains(&EngineEvent::DeviceStatus(DeviceStatus::Error)))
        .await
    );
    assert!(!recorder.events().contains(&EngineEvent::RecoveryRequested));
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_unsolicited_traffic_goes_to_data_callback() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(64, recorder.read_callback()));

    // Response nobody asked for, then a vendor notification
    device.inject_raw(vec![0x40, 0x02, 0x00, 0x01, 0x00]);
    device.inject_notification(0x0E, 0x01, vec![0xAB]);

    let data = recorder.clone();
    assert!(wait_until(LONG, || data.data().len() == 2).await);
    let frames = recorder.data();
    assert_eq!(frames[0].payload().as_ref(), &[0x00]);
    assert_eq!(frames[1].payload().as_ref(), &[0xAB]);
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_abort_read_then_rearm() {
    let (device, channel) = channel(SimulatedBusConfig::default());
    let recorder = Recorder::new();
    assert_ok!(channel.open(recorder.callbacks()).await);
    assert_ok!(channel.read(64, recorder.read_callback()));

    assert_eq!(channel.abort_read().await, Ok(true));
    assert!(!channel.is_read_pending());
    assert_eq!(channel.abort_read().await, Ok(false));

    let reads = recorder.clone();
    assert!(wait_until(LONG, || reads.reads().contains(&Err(UciError::Aborted))).await);

    // Let the in-flight IRQ wait run out, then traffic stays on the device
    // until a read is armed again
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.inject_notification(0x00, 0x01, vec![0x01]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(device.pending_frames(), 1);

    assert_ok!(channel.read(64, recorder.read_callback()));
    let events = recorder.clone();
    assert!(
        wait_until(LONG, || events
            .events()
            .contains(&EngineEvent::DeviceStatus(DeviceStatus::Ready)))
        .await
    );
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_transport_context_tracks_mode_and_last_write() {
    let (_device, channel) = channel(SimulatedBusConfig::default());
    assert_eq!(
        channel.transport_context().map(|c| c.last_bytes_written),
        Err(UciError::NotInitialized)
    );
    assert_ok!(channel.open(Recorder::new().callbacks()).await);

    assert_ok!(channel.write(&frame("60010001AA")).await);
    let context = assert_ok!(channel.transport_context());
    assert_eq!(context.last_bytes_written, 5);
    assert_eq!(context.mode, FramingMode::Uci);

    assert_ok!(channel.set_mode(FramingMode::Hbci));
    assert_eq!(channel.mode(), Ok(FramingMode::Hbci));
    assert_ok!(channel.close().await);
}

#[tokio::test]
async fn test_abort_then_immediate_rearm_keeps_completions_apart() {
    let (_device, channel) = channel(SimulatedBusConfig::default());
    let first = Recorder::new();
    let second = Recorder::new();
    assert_ok!(channel.open(first.callbacks()).await);

    assert_ok!(channel.read(64, first.read_callback()));
    assert_eq!(channel.abort_read().await, Ok(true));
    assert_ok!(channel.read(64, second.read_callback()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first.reads(), vec![Err(UciError::Aborted)]);
    assert!(!second.reads().contains(&Err(UciError::Aborted)));

    assert_ok!(channel.close().await);
    assert_eq!(first.reads().len(), 1);
    assert!(second.reads().contains(&Err(UciError::Aborted)));
}
