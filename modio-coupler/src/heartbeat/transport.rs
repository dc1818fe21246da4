/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! UDP multicast transport for heartbeats.
//!
//! The publisher and subscriber run as their own tokio tasks and talk to the
//! coupler actor over bounded channels, so socket I/O never interleaves with
//! the failover logic.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::HeartbeatMessage;

/// Heartbeats buffered between the actor and a transport task.
const CHANNEL_DEPTH: usize = 64;

/// Largest datagram accepted by the subscriber.
const MAX_DATAGRAM: usize = 512;

/// Pause after the first failed receive; doubles per consecutive failure.
const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next receive after `failures` consecutive errors.
fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECV_BACKOFF_MIN.saturating_mul(1 << shift).min(RECV_BACKOFF_MAX)
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid network address URL '{0}' (expected opc.udp://<ipv4-group>:<port>/)")]
    InvalidUrl(String),

    #[error("{0} is not a multicast group address")]
    NotMulticast(Ipv4Addr),

    #[error("unknown network interface '{0}'")]
    UnknownInterface(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// Multicast group plus the local interface to use for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastEndpoint {
    pub group: SocketAddrV4,
    pub interface: Ipv4Addr,
}

impl MulticastEndpoint {
    /// Build from the configured URL and interface.
    ///
    /// `interface` may be empty (any interface), an IPv4 address, or an
    /// interface name such as `eth0`.
    pub fn resolve(url: &str, interface: &str) -> Result<Self, TransportError> {
        let group = parse_network_address_url(url)?;
        if !group.ip().is_multicast() {
            return Err(TransportError::NotMulticast(*group.ip()));
        }
        let interface = resolve_interface(interface)?;
        Ok(Self { group, interface })
    }
}

/// Parse `opc.udp://224.0.0.22:4840/` (scheme optional, trailing slash
/// optional) into a socket address.
pub fn parse_network_address_url(url: &str) -> Result<SocketAddrV4, TransportError> {
    let rest = url.trim();
    let rest = rest.split_once("://").map_or(rest, |(_, r)| r);
    rest.trim_end_matches('/')
        .parse::<SocketAddrV4>()
        .map_err(|_| TransportError::InvalidUrl(url.to_string()))
}

fn resolve_interface(interface: &str) -> Result<Ipv4Addr, TransportError> {
    let interface = interface.trim();
    if interface.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(ip) = interface.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|errno| TransportError::Io(std::io::Error::from(errno)))?;
    addrs
        .filter(|ifa| ifa.interface_name == interface)
        .filter_map(|ifa| ifa.address.and_then(|a| a.as_sockaddr_in().copied()))
        .map(|sin| *SocketAddrV4::from(sin).ip())
        .next()
        .ok_or_else(|| TransportError::UnknownInterface(interface.to_string()))
}

// ── Publisher ─────────────────────────────────────────────────────────────────

/// Bind a sending socket and spawn the publisher task.
///
/// Returns the sender the actor pushes heartbeats into.
pub async fn publish(
    endpoint: MulticastEndpoint,
) -> Result<(mpsc::Sender<HeartbeatMessage>, JoinHandle<()>), TransportError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(endpoint.interface, 0)).await?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    info!(group = %endpoint.group, interface = %endpoint.interface, "heartbeat publisher ready");
    Ok(spawn_publisher(socket, SocketAddr::V4(endpoint.group)))
}

/// Publisher loop over an already bound socket.
pub fn spawn_publisher(
    socket: UdpSocket,
    target: SocketAddr,
) -> (mpsc::Sender<HeartbeatMessage>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HeartbeatMessage>(CHANNEL_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let bytes = match msg.encode() {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot encode heartbeat: {e}");
                    continue;
                }
            };
            if let Err(e) = socket.send_to(&bytes, target).await {
                warn!(target = %target, "heartbeat send failed: {e}");
            }
        }
        debug!("heartbeat publisher stopped");
    });
    (tx, task)
}

// ── Subscriber ────────────────────────────────────────────────────────────────

/// Join the multicast group and spawn the subscriber task.
///
/// Returns the receiver the actor drains.
pub async fn subscribe(
    endpoint: MulticastEndpoint,
) -> Result<(mpsc::Receiver<HeartbeatMessage>, JoinHandle<()>), TransportError> {
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, endpoint.group.port());
    let socket = UdpSocket::bind(bind).await?;
    socket.join_multicast_v4(*endpoint.group.ip(), endpoint.interface)?;
    info!(group = %endpoint.group, interface = %endpoint.interface, "subscribed to heartbeats");
    Ok(spawn_subscriber(socket))
}

/// Subscriber loop over an already bound socket.  Undecodable datagrams are
/// dropped.
pub fn spawn_subscriber(socket: UdpSocket) -> (mpsc::Receiver<HeartbeatMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<HeartbeatMessage>(CHANNEL_DEPTH);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut failures = 0u32;
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(r) => {
                    failures = 0;
                    r
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = recv_backoff(failures);
                    warn!(failures = failures, retry_in = ?pause, "heartbeat receive failed: {e}");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            match HeartbeatMessage::decode(&buf[..n]) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(from = %from, "dropping undecodable datagram: {e}"),
            }
        }
        debug!("heartbeat subscriber stopped");
    });
    (rx, task)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
