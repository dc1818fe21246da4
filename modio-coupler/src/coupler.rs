/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The coupler actor.
//!
//! One [`Coupler`] owns every piece of mutable state (relay boards, liveness
//! ledger, failover controller, heartbeat emitter) and is driven by a single
//! tokio task:
//!
//! ```text
//!   heart beat interval ──► emit_heartbeat ──► outgoing (publisher task)
//!   heart beat interval ──► check_liveness ──► FailoverController::tick
//!   incoming (subscriber task) ──► observe ──► LivenessLedger
//!   CouplerHandle ──Request──► read_variable / write_variable / status
//!   shutdown future ──► leave the loop
//! ```
//!
//! Because only this task touches the state, "look up last seen, then shut
//! relays down" can never interleave with recording a fresh heartbeat.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::binding::{
    self, BindingError, DataType, VariableDescriptor, VariableId, VariableValue,
};
use crate::config::CouplerConfig;
use crate::failover::{FailoverController, LivenessState, TickOutcome};
use crate::hardware::{BusError, I2cBus, RelayBoards};
use crate::heartbeat::{HeartbeatEmitter, HeartbeatMessage, HeartbeatObserver, Observation};
use crate::liveness::{now_millis, CouplerId, LivenessLedger};
use crate::pulse::DiagnosticPulse;

/// Pending client requests buffered in front of the actor.
const REQUEST_DEPTH: usize = 32;

// ── Requests and handle ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Request {
    Read {
        name: String,
        reply: oneshot::Sender<Result<VariableValue, BindingError>>,
    },
    Write {
        name: String,
        value: VariableValue,
        reply: oneshot::Sender<Result<(), BindingError>>,
    },
    List {
        reply: oneshot::Sender<Vec<VariableDescriptor>>,
    },
    Status {
        reply: oneshot::Sender<CouplerStatus>,
    },
}

/// Cloneable access to a running coupler for the variable server.
#[derive(Debug, Clone)]
pub struct CouplerHandle {
    tx: mpsc::Sender<Request>,
}

impl CouplerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, BindingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BindingError::Halted)?;
        rx.await.map_err(|_| BindingError::Halted)
    }

    pub async fn read(&self, name: &str) -> Result<VariableValue, BindingError> {
        let name = name.to_string();
        self.call(|reply| Request::Read { name, reply }).await?
    }

    pub async fn write(&self, name: &str, value: VariableValue) -> Result<(), BindingError> {
        let name = name.to_string();
        self.call(|reply| Request::Write { name, value, reply }).await?
    }

    pub async fn list_variables(&self) -> Result<Vec<VariableDescriptor>, BindingError> {
        self.call(|reply| Request::List { reply }).await
    }

    pub async fn status(&self) -> Result<CouplerStatus, BindingError> {
        self.call(|reply| Request::Status { reply }).await
    }
}

/// Point-in-time view of the coupler, for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouplerStatus {
    pub id: CouplerId,
    pub dependencies: BTreeMap<CouplerId, LivenessState>,
    pub safe_mode: bool,
    /// Effective virtual mode (configured or safe mode).
    pub virtual_mode: bool,
    pub configured_virtual: bool,
    pub safe_mode_counter: u32,
    pub ticks: u64,
    pub heart_beat: String,
    pub relay_states: Vec<u8>,
}

// ── Coupler ───────────────────────────────────────────────────────────────────

pub struct Coupler<B: I2cBus> {
    id: CouplerId,
    boards: RelayBoards<B>,
    ledger: LivenessLedger,
    emitter: HeartbeatEmitter,
    observer: HeartbeatObserver,
    failover: FailoverController,
    pulse: DiagnosticPulse,
    /// Current value of the `heart_beat` variable.
    heart_beat_value: f32,
    interval: Duration,
    requests: mpsc::Receiver<Request>,
    handle: CouplerHandle,
}

impl<B: I2cBus> Coupler<B> {
    pub fn new(config: &CouplerConfig, bus: B) -> Self {
        let (tx, requests) = mpsc::channel(REQUEST_DEPTH);
        let emitter = HeartbeatEmitter::new(config.id, config.pubsub);
        let heart_beat_value = emitter.value().to_packed();
        Self {
            id: config.id,
            boards: RelayBoards::new(bus, &config.slave_addresses, config.virtual_mode),
            ledger: LivenessLedger::new(),
            emitter,
            observer: HeartbeatObserver::new(config.id, config.pubsub),
            failover: FailoverController::new(
                &config.heart_beat_id_list,
                config.heart_beat_timeout_interval_ms,
            ),
            pulse: DiagnosticPulse::new(config.pulse_mode, config.pulse_gpio.clone()),
            heart_beat_value,
            interval: Duration::from_millis(config.heart_beat_interval_ms),
            requests,
            handle: CouplerHandle { tx },
        }
    }

    pub fn handle(&self) -> CouplerHandle {
        self.handle.clone()
    }

    pub fn boards(&self) -> &RelayBoards<B> {
        &self.boards
    }

    pub fn ledger(&self) -> &LivenessLedger {
        &self.ledger
    }

    /// Fail-safe default: every relay off before anything else happens.
    pub fn startup(&mut self) -> Result<(), BusError> {
        info!(boards = self.boards.board_count(), "forcing all relays off at startup");
        self.boards.safe_shutdown_all()
    }

    /// All relays off at exit.  Runs on every exit path, including SAFE MODE
    /// after a board failed to confirm its zero write.
    pub fn shutdown(&mut self) -> Result<(), BusError> {
        let result = self.boards.safe_shutdown_all();
        info!("SAFE mode counter={}", self.failover.safe_mode_counter());
        result
    }

    pub fn emit_heartbeat(&mut self) -> HeartbeatMessage {
        let msg = self.emitter.tick();
        self.heart_beat_value = msg.value().to_packed();
        msg
    }

    pub fn observe(&mut self, msg: &HeartbeatMessage, now: u64) -> Observation {
        let seen = self.observer.observe(msg, now, &mut self.ledger);
        if let Observation::Recorded(_) = seen {
            self.pulse.on_heartbeat();
        }
        seen
    }

    pub fn check_liveness(&mut self, now: u64) -> Result<TickOutcome, BusError> {
        self.failover.tick(&self.ledger, now, &mut self.boards)
    }

    pub fn read_variable(&mut self, name: &str) -> Result<VariableValue, BindingError> {
        match name.parse::<VariableId>()? {
            VariableId::HeartBeat => Ok(VariableValue::Float(self.heart_beat_value)),
            VariableId::Channel {
                board,
                channel,
                kind,
            } => binding::read_channel(&mut self.boards, board, channel, kind),
        }
    }

    pub fn write_variable(&mut self, name: &str, value: VariableValue) -> Result<(), BindingError> {
        match name.parse::<VariableId>()? {
            VariableId::HeartBeat => match value {
                VariableValue::Float(v) => {
                    self.heart_beat_value = v;
                    Ok(())
                }
                _ => Err(BindingError::TypeMismatch {
                    name: name.to_string(),
                    expected: DataType::Float,
                }),
            },
            VariableId::Channel {
                board,
                channel,
                kind,
            } => {
                let mask = binding::write_channel(&mut self.boards, board, channel, kind, value)?;
                debug!(variable = name, value = %value, mask = mask, "relay written");
                self.pulse.on_relay_write(board, channel);
                Ok(())
            }
        }
    }

    pub fn list_variables(&self) -> Vec<VariableDescriptor> {
        binding::catalogue(self.boards.board_count())
    }

    pub fn status(&self) -> CouplerStatus {
        let mode = self.boards.mode();
        CouplerStatus {
            id: self.id,
            dependencies: self.failover.states().clone(),
            safe_mode: self.failover.safe_mode(),
            virtual_mode: mode.is_virtual(),
            configured_virtual: mode.configured_virtual,
            safe_mode_counter: self.failover.safe_mode_counter(),
            ticks: self.emitter.ticks(),
            heart_beat: self.emitter.value().to_string(),
            relay_states: self.boards.relay_states().to_vec(),
        }
    }

    // ── Run loop ──────────────────────────────────────────────────────────────

    /// Drive the coupler until `shutdown` resolves or a fatal bus error
    /// occurs.
    ///
    /// `outgoing` is present when this coupler publishes heartbeats,
    /// `incoming` when it watches other couplers.  Relays are not shut off
    /// here; call [`shutdown`](Self::shutdown) afterwards.
    pub async fn run(
        &mut self,
        outgoing: Option<mpsc::Sender<HeartbeatMessage>>,
        mut incoming: Option<mpsc::Receiver<HeartbeatMessage>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BusError> {
        tokio::pin!(shutdown);

        let mut heart_beat = tokio::time::interval(self.interval);
        heart_beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = tokio::time::interval(self.interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watching = self.failover.is_watching();

        info!(
            id = %self.id,
            publishing = outgoing.is_some(),
            watching = watching,
            interval_ms = self.interval.as_millis() as u64,
            "coupler running"
        );

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                _ = heart_beat.tick(), if outgoing.is_some() => {
                    let msg = self.emit_heartbeat();
                    if let Some(tx) = &outgoing {
                        if let Err(e) = tx.try_send(msg) {
                            warn!("heartbeat not queued: {e}");
                        }
                    }
                }
                _ = liveness.tick(), if watching => {
                    if let Err(e) = self.check_liveness(now_millis()) {
                        error!("fatal bus error during safe shutdown: {e}");
                        break Err(e);
                    }
                }
                msg = next_heartbeat(&mut incoming) => match msg {
                    Some(msg) => {
                        self.observe(&msg, now_millis());
                    }
                    None => {
                        warn!("heartbeat subscriber closed");
                        incoming = None;
                    }
                },
                Some(req) = self.requests.recv() => {
                    if let Err(e) = self.serve(req) {
                        error!("fatal bus error: {e}");
                        break Err(e);
                    }
                }
            }
        };

        self.drain_requests();
        result
    }

    fn serve(&mut self, req: Request) -> Result<(), BusError> {
        match req {
            Request::Read { name, reply } => match self.read_variable(&name) {
                Err(BindingError::Bus(e)) if e.is_fatal() => {
                    let _ = reply.send(Err(BindingError::Halted));
                    return Err(e);
                }
                other => {
                    let _ = reply.send(other);
                }
            },
            Request::Write { name, value, reply } => match self.write_variable(&name, value) {
                Err(BindingError::Bus(e)) if e.is_fatal() => {
                    let _ = reply.send(Err(BindingError::Halted));
                    return Err(e);
                }
                other => {
                    let _ = reply.send(other);
                }
            },
            Request::List { reply } => {
                let _ = reply.send(self.list_variables());
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
        Ok(())
    }

    /// Refuse further requests; queued ones see their reply channel dropped.
    fn drain_requests(&mut self) {
        self.requests.close();
        while let Ok(req) = self.requests.try_recv() {
            drop(req);
        }
    }
}

async fn next_heartbeat(
    incoming: &mut Option<mpsc::Receiver<HeartbeatMessage>>,
) -> Option<HeartbeatMessage> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::bus::{InjectedFault, Transaction};
    use crate::hardware::{RecordingBus, REG_RELAYS};
    use crate::heartbeat::PubSubIds;

    const T0: u64 = 1_700_000_000_000;

    fn config(deps: &[u32], virtual_mode: bool) -> CouplerConfig {
        CouplerConfig {
            slave_addresses: vec![0x58, 0x59],
            virtual_mode,
            id: CouplerId(1),
            heart_beat: true,
            heart_beat_interval_ms: 20,
            heart_beat_timeout_interval_ms: 1000,
            heart_beat_id_list: deps.iter().map(|d| CouplerId(*d)).collect(),
            ..CouplerConfig::default()
        }
    }

    fn coupler(deps: &[u32], virtual_mode: bool) -> (Coupler<RecordingBus>, RecordingBus) {
        let rec = RecordingBus::new();
        (Coupler::new(&config(deps, virtual_mode), rec.clone()), rec)
    }

    fn peer(id: u32, tick: u64) -> HeartbeatMessage {
        let mut e = HeartbeatEmitter::new(CouplerId(id), PubSubIds::default());
        let mut msg = e.tick();
        msg.tick = tick;
        msg
    }

    // ── synchronous operations ────────────────────────────────────────────────

    #[test]
    fn startup_forces_every_board_off() {
        let (mut c, rec) = coupler(&[], false);
        c.startup().unwrap();
        assert_eq!(
            rec.transactions(),
            vec![
                Transaction::Write {
                    addr: 0x58,
                    bytes: vec![REG_RELAYS, 0, 0x65]
                },
                Transaction::Write {
                    addr: 0x59,
                    bytes: vec![REG_RELAYS, 0, 0x65]
                },
            ]
        );
    }

    #[test]
    fn relay_write_then_read_by_name() {
        let (mut c, _) = coupler(&[], false);
        c.write_variable("i2c1.relay2", VariableValue::Int32(1)).unwrap();
        assert_eq!(
            c.read_variable("i2c1.relay2").unwrap(),
            VariableValue::Int32(1)
        );
        assert_eq!(c.boards().relay_states(), &[0, 0b0100]);
        assert!(matches!(
            c.read_variable("i2c2.relay0"),
            Err(BindingError::UnknownVariable(_))
        ));
    }

    #[test]
    fn heart_beat_variable_tracks_emitter() {
        let (mut c, _) = coupler(&[], false);
        for _ in 0..7 {
            c.emit_heartbeat();
        }
        assert_eq!(
            c.read_variable("heart_beat").unwrap(),
            VariableValue::Float(1.7)
        );
        assert_eq!(c.status().heart_beat, "1.7");

        c.write_variable("heart_beat", VariableValue::Float(9.5)).unwrap();
        assert_eq!(
            c.read_variable("heart_beat").unwrap(),
            VariableValue::Float(9.5)
        );
        assert!(matches!(
            c.write_variable("heart_beat", VariableValue::Int32(1)),
            Err(BindingError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn own_heartbeat_is_not_recorded() {
        let (mut c, _) = coupler(&[1, 7], false);
        let own = c.emit_heartbeat();
        assert_eq!(c.observe(&own, T0), Observation::OwnHeartbeat);
        assert!(c.ledger().is_empty());
    }

    #[test]
    fn down_then_recovered_through_the_coupler() {
        let (mut c, rec) = coupler(&[7], false);
        c.write_variable("i2c0.relay0", VariableValue::Int32(1)).unwrap();
        c.observe(&peer(7, 1), T0);
        c.check_liveness(T0 + 100).unwrap();
        rec.clear();

        let out = c.check_liveness(T0 + 1_500).unwrap();
        assert!(out.entered_safe_mode);
        let st = c.status();
        assert!(st.safe_mode && st.virtual_mode);
        assert_eq!(st.relay_states, vec![0, 0]);
        assert_eq!(st.safe_mode_counter, 1);
        assert_eq!(st.dependencies[&CouplerId(7)], LivenessState::Down);

        // Relay writes are refused while safe mode lasts.
        let writes = rec.transaction_count();
        assert!(matches!(
            c.write_variable("i2c0.relay1", VariableValue::Int32(1)),
            Err(BindingError::Bus(BusError::SafeMode { board: 0 }))
        ));
        assert_eq!(rec.transaction_count(), writes);
        assert_eq!(c.status().relay_states, vec![0, 0]);

        c.observe(&peer(7, 2), T0 + 1_600);
        let out = c.check_liveness(T0 + 2_000).unwrap();
        assert!(out.left_safe_mode);
        assert!(!c.status().virtual_mode);
        assert_eq!(c.status().safe_mode_counter, 1);

        // The first write after recovery reaches the board.
        rec.clear();
        c.write_variable("i2c0.relay1", VariableValue::Int32(1)).unwrap();
        assert_eq!(
            rec.transactions(),
            vec![Transaction::Write {
                addr: 0x58,
                bytes: vec![REG_RELAYS, 0b0010, 0x65]
            }]
        );
    }

    #[test]
    fn exit_shutdown_after_a_fatal_safe_mode_entry_reports_the_dead_board() {
        let (mut c, rec) = coupler(&[7], false);
        c.write_variable("i2c0.relay0", VariableValue::Int32(1)).unwrap();
        c.write_variable("i2c1.relay0", VariableValue::Int32(1)).unwrap();
        c.observe(&peer(7, 1), T0);
        c.check_liveness(T0 + 100).unwrap();
        rec.inject_for(0x58, Some(InjectedFault::Address));
        rec.clear();

        assert!(c.check_liveness(T0 + 1_500).unwrap_err().is_fatal());
        assert!(c.status().safe_mode);
        assert_eq!(c.status().relay_states, vec![0, 0]);
        assert_eq!(rec.transaction_count(), 2, "both boards were attempted");

        rec.clear();
        assert!(c.shutdown().unwrap_err().is_fatal());
        assert_eq!(rec.transaction_count(), 1, "only the dead board is retried");

        rec.inject_for(0x58, None);
        c.shutdown().unwrap();
        assert!(c.boards().unconfirmed_boards().is_empty());
    }

    #[test]
    fn list_variables_matches_board_count() {
        let (c, _) = coupler(&[], false);
        let names: Vec<String> = c.list_variables().into_iter().map(|d| d.name).collect();
        assert_eq!(names.len(), 25);
        assert!(names.contains(&"i2c1.ain3".to_string()));
    }

    #[test]
    fn shutdown_zeroes_relays() {
        let (mut c, _) = coupler(&[], true);
        c.write_variable("i2c0.relay3", VariableValue::Int32(1)).unwrap();
        c.shutdown().unwrap();
        assert_eq!(c.boards().relay_states(), &[0, 0]);
    }

    // ── run loop ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_serves_handle_requests_until_shutdown() {
        let (mut c, _) = coupler(&[], true);
        let handle = c.handle();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let res = c
                .run(None, None, async {
                    let _ = stop_rx.await;
                })
                .await;
            (c, res)
        });

        handle
            .write("i2c0.relay1", VariableValue::Int32(1))
            .await
            .unwrap();
        assert_eq!(
            handle.read("i2c0.relay1").await.unwrap(),
            VariableValue::Int32(1)
        );
        assert!(matches!(
            handle.write("i2c0.in1", VariableValue::Boolean(true)).await,
            Err(BindingError::ReadOnly(_))
        ));
        assert_eq!(handle.list_variables().await.unwrap().len(), 25);
        assert_eq!(handle.status().await.unwrap().relay_states, vec![0b0010, 0]);

        stop_tx.send(()).unwrap();
        let (_c, res) = task.await.unwrap();
        assert!(res.is_ok());
        assert!(matches!(
            handle.status().await,
            Err(BindingError::Halted)
        ));
    }

    #[tokio::test]
    async fn run_publishes_heartbeats() {
        let (mut c, _) = coupler(&[], true);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            c.run(Some(out_tx), None, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.coupler_id, CouplerId(1));
        assert_eq!(second.tick, first.tick + 1);

        stop_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn run_enters_safe_mode_when_peer_falls_silent() {
        let mut cfg = config(&[7], false);
        cfg.heart_beat_timeout_interval_ms = 100;
        let rec = RecordingBus::new();
        let mut c = Coupler::new(&cfg, rec.clone());
        let handle = c.handle();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            c.run(None, Some(in_rx), async {
                let _ = stop_rx.await;
            })
            .await
        });

        handle
            .write("i2c0.relay0", VariableValue::Int32(1))
            .await
            .unwrap();
        in_tx.send(peer(7, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let st = handle.status().await.unwrap();
        assert_eq!(st.dependencies[&CouplerId(7)], LivenessState::Up);
        assert!(!st.safe_mode);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let st = handle.status().await.unwrap();
        assert!(st.safe_mode);
        assert_eq!(st.safe_mode_counter, 1);
        assert_eq!(st.relay_states, vec![0, 0]);

        in_tx.send(peer(7, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let st = handle.status().await.unwrap();
        assert!(!st.safe_mode);
        assert_eq!(st.safe_mode_counter, 1);

        stop_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fatal_bus_error_halts_the_actor() {
        let (mut c, rec) = coupler(&[], false);
        let handle = c.handle();
        rec.inject(Some(InjectedFault::Open));
        let task = tokio::spawn(async move { c.run(None, None, std::future::pending()).await });

        assert!(matches!(
            handle.write("i2c0.relay0", VariableValue::Int32(1)).await,
            Err(BindingError::Halted)
        ));
        let res = task.await.unwrap();
        assert!(matches!(res, Err(BusError::Open { .. })));
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_stop_the_actor() {
        let (mut c, _) = coupler(&[7], true);
        let handle = c.handle();
        let (in_tx, in_rx) = mpsc::channel::<HeartbeatMessage>(1);
        drop(in_tx);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            c.run(None, Some(in_rx), async {
                let _ = stop_rx.await;
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.status().await.is_ok());
        stop_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
