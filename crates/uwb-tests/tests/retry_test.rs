//! Retry policy seen through the engine
//!
//! Run with: cargo test -p uwb-tests --test retry_test

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};
use uwb_core::{gid, oid, DeviceStatus, EventId, UciStatus};
use uwb_tests::{wait_until, Harness};
use uwb_uci::bus::Reply;
use uwb_uci::config::SimulatedBusConfig;
use uwb_uci::{DeviceState, UciError};

async fn operational() -> Harness {
    Harness::operational(SimulatedBusConfig::default()).await
}

#[tokio::test]
async fn test_retry_status_and_notification_are_absorbed() {
    let harness = operational().await;
    let retries_before = harness.engine.stats().retries;
    harness
        .device
        .push_reply(gid::CORE, oid::core::SET_CONFIG, Reply::status(UciStatus::CommandRetry));
    harness
        .device
        .push_reply(gid::CORE, oid::core::SET_CONFIG, Reply::RetryNtf);

    assert_ok!(harness.engine.core_set_config(&[(0xE4, vec![0x01])]).await);

    assert_eq!(
        harness
            .device
            .command_count(gid::CORE, oid::core::SET_CONFIG),
        3
    );
    assert_eq!(harness.engine.stats().retries - retries_before, 2);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_mismatched_response_is_retried() {
    let harness = operational().await;
    harness.device.push_reply(
        gid::CORE,
        oid::core::GET_CONFIG,
        Reply::Frames(vec![vec![0x40, 0x02, 0x00, 0x01, 0x00]]),
    );

    let response = assert_ok!(
        harness
            .engine
            .send_command(gid::CORE, oid::core::GET_CONFIG, vec![0x01, 0xE4])
            .await
    );

    assert!(response.status.is_ok());
    assert_eq!(harness.engine.stats().protocol_errors, 1);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_silent_device_exhausts_attempts() {
    let harness = operational().await;
    harness
        .device
        .set_reply(gid::SESSION_CONFIG, oid::session_config::INIT, Reply::Silent);

    let err = assert_err!(
        harness
            .engine
            .send_command(
                gid::SESSION_CONFIG,
                oid::session_config::INIT,
                vec![0x01, 0x00, 0x00, 0x00, 0x00]
            )
            .await
    );

    assert_eq!(
        err,
        UciError::RetriesExhausted {
            event: EventId::new(gid::SESSION_CONFIG, oid::session_config::INIT),
            attempts: 3,
            last: Box::new(UciError::Timeout),
        }
    );
    assert_eq!(
        harness
            .device
            .command_count(gid::SESSION_CONFIG, oid::session_config::INIT),
        3
    );
    assert!(!harness.engine.channel().has_pending());
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_device_error_state_backs_off_without_sending() {
    let harness = operational().await;
    harness.device.inject_device_status(DeviceStatus::Error);
    let engine = &harness.engine;
    assert!(wait_until(Duration::from_millis(500), || engine.state() == DeviceState::Error).await);
    let sent_before = harness.device.transmitted().len();

    assert_eq!(
        harness.engine.send_command(gid::CORE, oid::core::DEVICE_INFO, Vec::new()).await,
        Err(UciError::NotInitialized)
    );
    let err = assert_err!(
        harness
            .engine
            .retry()
            .send(gid::CORE, oid::core::DEVICE_INFO, Vec::new())
            .await
    );

    assert_eq!(err.status(), None);
    assert!(matches!(
        err,
        UciError::RetriesExhausted { ref last, .. } if **last == UciError::DeviceError
    ));
    assert_eq!(harness.device.transmitted().len(), sent_before);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_rejected_command_fails_at_once() {
    let harness = operational().await;
    harness.device.set_reply(
        gid::SESSION_CONTROL,
        oid::session_control::START,
        Reply::status(UciStatus::Rejected),
    );

    let err = assert_err!(
        harness
            .engine
            .send_command(
                gid::SESSION_CONTROL,
                oid::session_control::START,
                vec![0x01, 0x00, 0x00, 0x00]
            )
            .await
    );

    assert_eq!(err.status(), Some(UciStatus::Rejected));
    assert_eq!(
        harness
            .device
            .command_count(gid::SESSION_CONTROL, oid::session_control::START),
        1
    );
    assert_ok!(harness.engine.close().await);
}
