//! Device bring-up against the simulated controller
//!
//! Run with: cargo test -p uwb-tests --test lifecycle_test

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};
use uwb_core::{gid, oid, DeviceStatus};
use uwb_tests::{fast_config, firmware_file, wait_until, Harness};
use uwb_uci::config::{BoardCommand, SimulatedBusConfig};
use uwb_uci::{DeviceState, EngineEvent, FirmwareImage, UciError};

fn bootloader() -> SimulatedBusConfig {
    SimulatedBusConfig {
        bootloader: true,
        ..SimulatedBusConfig::default()
    }
}

#[tokio::test]
async fn test_bring_up_from_flash_reaches_operational() {
    let harness = Harness::new(SimulatedBusConfig::default());
    assert_ok!(harness.open().await);

    assert_ok!(harness.engine.initialize().await);

    assert_eq!(harness.engine.state(), DeviceState::Operational);
    assert_eq!(
        harness
            .device
            .command_count(gid::CORE, oid::core::DEVICE_RESET),
        1
    );

    let recorder = harness.recorder.clone();
    assert!(
        wait_until(Duration::from_millis(500), || recorder
            .states()
            .ends_with(&[
                DeviceState::Configuring,
                DeviceState::Resetting,
                DeviceState::Operational
            ]))
        .await
    );
    let events = harness.recorder.events();
    assert!(events.contains(&EngineEvent::DeviceStatus(DeviceStatus::Init)));
    assert!(events.contains(&EngineEvent::DeviceStatus(DeviceStatus::Ready)));

    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_board_configuration_is_sent_before_reset() {
    let mut config = fast_config();
    config.lifecycle.board_config = vec![
        BoardCommand {
            gid: 0x00,
            oid: 0x04,
            payload: "01E40101".to_string(),
        },
        BoardCommand {
            gid: 0x0F,
            oid: 0x21,
            payload: String::new(),
        },
    ];
    let harness = Harness::with_config(SimulatedBusConfig::default(), config);
    assert_ok!(harness.open().await);

    assert_ok!(harness.engine.initialize().await);

    let sent = harness.device.transmitted();
    let position = |bytes: &[u8]| sent.iter().position(|f| f.as_slice() == bytes);
    let set_config = position(&[0x20, 0x04, 0x00, 0x04, 0x01, 0xE4, 0x01, 0x01]);
    let vendor = position(&[0x2F, 0x21, 0x00, 0x00]);
    let reset = position(&[0x20, 0x00, 0x00, 0x01, 0x00]);

    assert!(set_config.is_some() && vendor.is_some() && reset.is_some());
    assert!(set_config < vendor);
    assert!(vendor < reset);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_firmware_download_then_bring_up() {
    let harness = Harness::new(bootloader());
    assert_ok!(harness.open().await);
    let image = FirmwareImage::from_bytes((0..=255u8).cycle().take(300).collect::<Vec<_>>());

    assert_ok!(harness.engine.initialize_with(Some(&image)).await);

    assert_eq!(harness.engine.state(), DeviceState::Operational);
    assert!(harness.device.is_running_firmware());
    assert_eq!(harness.device.firmware_received().len(), 300);
    assert!(harness.recorder.states().contains(&DeviceState::FwDownload));
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_firmware_path_from_config() {
    let image = vec![0xA5; 130];
    let file = firmware_file(&image);
    let mut config = fast_config();
    config.firmware.path = Some(file.path().display().to_string());
    let harness = Harness::with_config(bootloader(), config);
    assert_ok!(harness.open().await);

    assert_ok!(harness.engine.initialize().await);

    assert_eq!(harness.device.firmware_received(), image);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_missing_boot_status_times_out() {
    // Bootloader waits for an image that never comes
    let harness = Harness::new(bootloader());
    assert_ok!(harness.open().await);

    let err = assert_err!(harness.engine.initialize().await);

    assert_eq!(err, UciError::InitTimeout { stage: "boot" });
    assert_ne!(harness.engine.state(), DeviceState::Operational);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_missing_ready_after_reset_times_out() {
    let harness = Harness::new(SimulatedBusConfig {
        ready_after_reset: false,
        ..SimulatedBusConfig::default()
    });
    assert_ok!(harness.open().await);

    let err = assert_err!(harness.engine.initialize().await);

    assert_eq!(err, UciError::InitTimeout { stage: "ready" });
    assert_eq!(harness.engine.state(), DeviceState::Resetting);
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_initialize_requires_open_channel() {
    let harness = Harness::new(SimulatedBusConfig::default());

    assert_eq!(
        harness.engine.initialize().await,
        Err(UciError::NotInitialized)
    );
}

#[tokio::test]
async fn test_commands_refused_before_bring_up() {
    let harness = Harness::new(SimulatedBusConfig::default());
    assert_ok!(harness.open().await);

    assert_eq!(
        harness.engine.core_get_device_info().await,
        Err(UciError::NotInitialized)
    );
    assert!(harness.device.transmitted().is_empty());
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_device_info_after_bring_up() {
    let harness = Harness::operational(SimulatedBusConfig::default()).await;

    let info = assert_ok!(harness.engine.core_get_device_info().await);

    assert_eq!(info.uci_version, 0x0100);
    assert_eq!(info.mac_version, 0x0201);
    assert_eq!(info.phy_version, 0x0200);
    assert_eq!(info.test_version, 0x0003);
    assert!(info.vendor.is_empty());
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_low_power_wakeup_round_trip() {
    let harness = Harness::operational(SimulatedBusConfig::default()).await;

    harness.device.inject_device_status(DeviceStatus::HdpWakeup);
    let engine = &harness.engine;
    assert!(
        wait_until(Duration::from_millis(500), || engine.state()
            == DeviceState::LowPowerWakeup)
        .await
    );

    harness.device.inject_device_status(DeviceStatus::Ready);
    assert!(
        wait_until(Duration::from_millis(500), || engine.state()
            == DeviceState::Operational)
        .await
    );
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_device_reset_while_operational() {
    let harness = Harness::operational(SimulatedBusConfig::default()).await;

    assert_ok!(harness.engine.core_device_reset().await);

    let recorder = harness.recorder.clone();
    assert!(
        wait_until(Duration::from_millis(500), || recorder
            .events()
            .iter()
            .filter(|e| **e == EngineEvent::DeviceStatus(DeviceStatus::Ready))
            .count()
            == 2)
        .await
    );
    assert_eq!(harness.engine.state(), DeviceState::Operational);
    assert_eq!(
        harness
            .device
            .command_count(gid::CORE, oid::core::DEVICE_RESET),
        2
    );
    assert_ok!(harness.engine.close().await);
}

#[tokio::test]
async fn test_device_error_during_boot_fails_without_waiting() {
    let mut config = fast_config();
    config.lifecycle.boot_timeout_ms = 5_000;
    let harness = Harness::with_config(bootloader(), config);
    assert_ok!(harness.open().await);

    let started = std::time::Instant::now();
    let (result, _) = tokio::join!(harness.engine.initialize(), async {
        // After the reset pulse, while the boot stage waits
        tokio::time::sleep(Duration::from_millis(30)).await;
        harness.device.inject_device_status(DeviceStatus::Error);
    });

    assert_eq!(result, Err(UciError::DeviceError));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(harness.engine.state(), DeviceState::Error);
    assert_ok!(harness.engine.close().await);
}
