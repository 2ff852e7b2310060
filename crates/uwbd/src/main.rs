//! uwbd - UWB Controller Daemon
//!
//! Opens the UCI channel to a UWB controller, runs device bring-up
//! (optionally downloading firmware) and logs notifications until stopped.
//!
//! Usage:
//!   uwbd [OPTIONS] [config.toml]
//!
//! Options:
//!   --firmware <path>  Download this image during bring-up
//!   --json             Emit logs as JSON
//!
//! If no config file is provided, runs against the simulated device.

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uwb_uci::{Callbacks, EngineConfig, EngineEvent, UciEngine};

/// Parsed command-line arguments
struct Args {
    /// Engine config file (TOML)
    config_path: Option<String>,
    /// Firmware image overriding the configured one
    firmware: Option<String>,
    json_logs: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        firmware: None,
        json_logs: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--firmware" | "-f" => {
                if i + 1 < args.len() {
                    result.firmware = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("Missing argument for --firmware");
                    i += 1;
                }
            }
            "--json" => {
                result.json_logs = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                i += 1;
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"uwbd - UWB Controller Daemon

Usage: uwbd [OPTIONS] [config.toml]

Options:
  -f, --firmware <path>  Download this firmware image during bring-up
      --json             Emit logs as JSON
  -h, --help             Print this help message

Examples:
  # Run against the simulated device
  uwbd

  # Run with config file
  uwbd config.toml

  # Force a firmware download
  uwbd --firmware fw/uwb_main.bin config.toml
"#
    );
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "uwbd=info,uwb_uci=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::StateChanged { from, to } => {
            tracing::info!(%from, %to, "Device state changed");
        }
        EngineEvent::DeviceStatus(status) => {
            tracing::debug!(%status, "Device status");
        }
        EngineEvent::SessionStatus {
            session_id,
            state,
            reason,
        } => {
            tracing::info!(session_id, state, reason, "Session status");
        }
        EngineEvent::Credit {
            session_id,
            available,
        } => {
            tracing::debug!(session_id, available, "Data credit");
        }
        EngineEvent::GenericError(status) => {
            tracing::warn!(%status, "Generic error notification");
        }
        EngineEvent::RecoveryRequested => {
            tracing::warn!("Device reported an error, recovery required");
        }
        EngineEvent::Closed => {
            tracing::info!("Channel closed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    init_logging(args.json_logs);

    tracing::info!("Starting uwbd (UWB Controller Daemon)");

    let mut config = if let Some(ref path) = args.config_path {
        tracing::info!("Loading config from: {}", path);
        EngineConfig::load(path).with_context(|| format!("loading {}", path))?
    } else {
        tracing::info!("No config file provided, using simulated device");
        EngineConfig::default()
    };
    if let Some(firmware) = args.firmware {
        config.firmware.path = Some(firmware);
    }

    let engine = UciEngine::from_config(config).context("creating engine")?;

    let callbacks = Callbacks::new().on_event(log_event).on_data(|frame| {
        tracing::debug!(len = frame.payload().len(), "Unsolicited frame");
    });
    engine.open(callbacks).await.context("opening UCI channel")?;

    if let Err(e) = engine.initialize().await {
        tracing::error!(error = %e, category = ?e.category(), "Device bring-up failed");
        engine.close().await.ok();
        return Err(e.into());
    }

    let info = engine.core_get_device_info().await?;
    tracing::info!(vendor = %format!("{:02X?}", info.vendor.as_ref()), "Device ready");

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    let stats = engine.stats();
    tracing::info!(
        frames_read = stats.frames_read,
        frames_written = stats.frames_written,
        retries = stats.retries,
        protocol_errors = stats.protocol_errors,
        "Channel statistics"
    );
    engine.close().await?;

    Ok(())
}
