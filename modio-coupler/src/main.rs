/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use modio_coupler::config::{ConfigFile, ConfigOverrides, CouplerConfig};
use modio_coupler::coupler::Coupler;
use modio_coupler::hardware::LinuxI2cBus;
use modio_coupler::heartbeat::transport::{self, MulticastEndpoint};
use modio_coupler::pulse::PulseMode;

// ── CLI argument definition ───────────────────────────────────────────────────

/// MOD-IO relay coupler.
///
/// Example:
///   modio-coupler -d /dev/i2c-1 -s 0x58,0x59 -i 1 -b 1 -l 2,3
#[derive(Debug, Parser)]
#[command(
    name = "modio-coupler",
    version,
    about = "Controls MOD-IO relays over I2C and fails safe when a watched coupler goes silent",
    long_about = None,
)]
struct Cli {
    /// YAML configuration file; command line values take precedence.
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,

    /// Linux i2c-dev device path [default: /dev/i2c-1].
    #[arg(short = 'd', long = "device")]
    device: Option<PathBuf>,

    /// Comma separated list of hex slave addresses [default: 0x58].
    #[arg(short = 's', long = "slave-address-list")]
    slave_address_list: Option<String>,

    /// 0 drives the boards, 1 is virtual (no bus access) [default: 0].
    #[arg(short = 'm', long = "mode")]
    mode: Option<u8>,

    /// ID of this coupler [default: 0].
    #[arg(short = 'i', long = "id")]
    id: Option<u32>,

    /// Publish heart beats to other couplers (0/1) [default: 0].
    #[arg(short = 'b', long = "heart-beat")]
    heart_beat: Option<u8>,

    /// Heart beat interval in ms [default: 250].
    #[arg(short = 't', long = "heart-beat-interval")]
    heart_beat_interval: Option<u64>,

    /// Heart beat timeout in ms [default: 4 x interval].
    #[arg(short = 'o', long = "heart-beat-timeout-interval")]
    heart_beat_timeout_interval: Option<u64>,

    /// Comma separated hex IDs of couplers to watch.  A missing heart beat
    /// sends this coupler to safe mode.
    #[arg(short = 'l', long = "heart-beat-id-list")]
    heart_beat_id_list: Option<String>,

    /// Multicast URL for heart beats [default: opc.udp://224.0.0.22:4840/].
    #[arg(short = 'n', long = "network-address-url-data-type")]
    network_address_url_data_type: Option<String>,

    /// Network interface (name or IPv4 address) for heart beats.
    #[arg(short = 'j', long = "network-interface")]
    network_interface: Option<String>,

    /// Diagnostic pulse output.
    #[arg(long = "pulse-mode", value_enum)]
    pulse_mode: Option<PulseMode>,

    /// sysfs GPIO value file toggled by the diagnostic pulse.
    #[arg(long = "pulse-gpio")]
    pulse_gpio: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
            slave_address_list: self.slave_address_list.clone(),
            mode: self.mode,
            id: self.id,
            heart_beat: self.heart_beat.map(|b| b != 0),
            heart_beat_interval: self.heart_beat_interval,
            heart_beat_timeout_interval: self.heart_beat_timeout_interval,
            heart_beat_id_list: self.heart_beat_id_list.clone(),
            network_address_url_data_type: self.network_address_url_data_type.clone(),
            network_interface: self.network_interface.clone(),
            pulse_mode: self.pulse_mode,
            pulse_gpio: self.pulse_gpio.clone(),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("MOD-IO coupler starting up...");

    // ── Configuration ─────────────────────────────────────────────────────────
    let file = cli
        .config
        .as_deref()
        .map(ConfigFile::load)
        .transpose()
        .context("Failed to load configuration file")?;
    let config =
        CouplerConfig::resolve(file, cli.overrides()).context("Invalid configuration")?;
    config.log_summary();

    // ── Hardware, fail-safe default ───────────────────────────────────────────
    let bus = LinuxI2cBus::new(&config.device);
    let mut coupler = Coupler::new(&config, bus);
    if let Err(e) = coupler.startup() {
        return Err(e).context("Cannot force relays off at startup");
    }

    // ── Heart beat transport ──────────────────────────────────────────────────
    let wiring = async {
        let endpoint =
            MulticastEndpoint::resolve(&config.network_address_url, &config.network_interface)?;
        let outgoing = if config.heart_beat {
            Some(transport::publish(endpoint).await?)
        } else {
            None
        };
        let incoming = if config.heart_beat_check_enabled() {
            Some(transport::subscribe(endpoint).await?)
        } else {
            None
        };
        Ok::<_, transport::TransportError>((outgoing, incoming))
    };
    let (outgoing, incoming) = match wiring.await {
        Ok(pair) => pair,
        Err(e) => {
            if let Err(shutdown) = coupler.shutdown() {
                error!("Cannot force relays off at exit: {shutdown}");
            }
            return Err(e).context("Cannot set up heart beat transport");
        }
    };
    let (outgoing_tx, publisher) = outgoing.unzip();
    let (incoming_rx, subscriber) = incoming.unzip();

    // ── Run until signalled ───────────────────────────────────────────────────
    let outcome = coupler
        .run(outgoing_tx, incoming_rx, shutdown_signal())
        .await;

    for task in [publisher, subscriber].into_iter().flatten() {
        task.abort();
    }

    // Relays go off on every exit path.
    let shutdown = coupler.shutdown();
    outcome.context("Coupler stopped on a fatal bus error")?;
    shutdown.context("Cannot force relays off at exit")?;
    info!("MOD-IO coupler stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
