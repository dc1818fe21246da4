/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Heartbeat peer simulator.
//!
//! Pretends to be a remote coupler: publishes heartbeats for `--id` on the
//! multicast group, optionally falls silent after `--stop-after` ticks (the
//! watching coupler should go to SAFE MODE) and optionally resumes after
//! `--resume-after-ms` (it should go back to NORMAL MODE).
//!
//! Example:
//!   peer-sim --id 7 --interval 250 --stop-after 20 --resume-after-ms 3000

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use modio_coupler::heartbeat::transport::{self, MulticastEndpoint};
use modio_coupler::heartbeat::{HeartbeatEmitter, PubSubIds};
use modio_coupler::liveness::CouplerId;

#[derive(Debug, Parser)]
#[command(
    name = "peer-sim",
    about = "Simulated remote coupler publishing heart beats – NOT for production",
    long_about = None,
)]
struct Cli {
    /// Coupler ID to impersonate.
    #[arg(long, default_value_t = 7)]
    id: u32,

    /// Heart beat interval in ms.
    #[arg(long, default_value_t = 250)]
    interval: u64,

    /// Go silent after this many heart beats.
    #[arg(long)]
    stop_after: Option<u64>,

    /// Resume publishing this long after going silent.
    #[arg(long)]
    resume_after_ms: Option<u64>,

    /// Multicast URL, as given to the coupler.
    #[arg(short = 'n', long, default_value = "opc.udp://224.0.0.22:4840/")]
    network_address_url: String,

    /// Network interface (name or IPv4 address).
    #[arg(short = 'j', long, default_value = "")]
    network_interface: String,

    /// Writer group ID; must match the coupler's.
    #[arg(long, default_value_t = PubSubIds::default().writer_group_id)]
    writer_group_id: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let endpoint = MulticastEndpoint::resolve(&cli.network_address_url, &cli.network_interface)
        .context("Invalid multicast endpoint")?;
    let (tx, _publisher) = transport::publish(endpoint)
        .await
        .context("Cannot open heart beat publisher")?;

    let ids = PubSubIds {
        writer_group_id: cli.writer_group_id,
        ..PubSubIds::default()
    };
    let mut emitter = HeartbeatEmitter::new(CouplerId(cli.id), ids);
    let mut timer = tokio::time::interval(Duration::from_millis(cli.interval.max(1)));
    let mut silenced = false;

    info!(id = cli.id, interval_ms = cli.interval, group = %endpoint.group, "peer-sim publishing");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(ticks = emitter.ticks(), "peer-sim stopped");
                return Ok(());
            }
            _ = timer.tick() => {}
        }

        if !silenced && cli.stop_after.is_some_and(|n| emitter.ticks() >= n) {
            silenced = true;
            info!(ticks = emitter.ticks(), "going silent");
            match cli.resume_after_ms {
                Some(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    info!("resuming heart beats");
                    timer.reset();
                }
                None => {
                    tokio::signal::ctrl_c().await.context("Cannot wait for Ctrl-C")?;
                    return Ok(());
                }
            }
        }

        let msg = emitter.tick();
        tx.send(msg).await.context("Publisher task stopped")?;
        info!(heart_beat = %msg.value(), "sent");
    }
}
