//! Local LIPP driver.
//!
//! A [`LippDriver`] binds the unit-side sockets of one equipment instance,
//! starts the driver process and runs three monitors per process incarnation:
//!
//! - **ready-waiter**: reads the ready packet and settles the detection phase
//! - **exit monitor**: waits on the process and reacts to unplanned exits
//! - **probe monitor**: records probe messages and gives up on silence while detected
//!
//! Teardown happens at most once. When the driver was built with an event
//! sender, teardowns that call for a new slot occupant (absent mount, probe
//! silence, crashed process) are reported as [`SlotEvent`]s and the slot
//! manager decides between morphing and resurrecting. A standalone driver
//! instead restarts its crashed process in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::address::{LippAddress, SocketNaming};
use super::correlator::Correlator;
use super::probe::ProbeChannel;
use super::protocol::Detection;
use super::state::{LivenessSnapshot, LivenessState};
use super::supervisor::{CommandTemplate, ExitOutcome, ProcessSupervisor};
use super::transport::{DatagramSocket, TransportChannel};
use crate::config::DriverConfig;
use crate::driver_interface::{EquipmentDriver, Params};
use crate::equipment::EquipmentIdentity;
use crate::error::{UnitError, UnitResult};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Teardown events
// =============================================================================

/// Why a driver was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The mount's ready packet said `not-detected`
    NotDetected,
    /// No probe message within the probe timeout while detected
    ProbeTimeout,
    /// The process ended without being asked to
    ProcessExited,
    /// `quit` was requested
    Quit,
    /// The slot was given to another occupant
    Replaced,
}

impl TeardownReason {
    /// Whether the slot needs a new occupant afterwards.
    pub fn wants_replacement(self) -> bool {
        matches!(
            self,
            TeardownReason::NotDetected | TeardownReason::ProbeTimeout | TeardownReason::ProcessExited
        )
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownReason::NotDetected => "not-detected",
            TeardownReason::ProbeTimeout => "probe-timeout",
            TeardownReason::ProcessExited => "process-exited",
            TeardownReason::Quit => "quit",
            TeardownReason::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

/// A slot-managed driver finished tearing itself down.
#[derive(Debug, Clone)]
pub struct SlotEvent {
    /// Identity of the slot
    pub identity: EquipmentIdentity,
    /// [`LippDriver::id`] of the driver that went away
    pub driver_id: u64,
    /// Why it went away
    pub reason: TeardownReason,
}

/// Sender half handed to slot-managed drivers.
pub type SlotEventSender = mpsc::UnboundedSender<SlotEvent>;

// =============================================================================
// LippDriver
// =============================================================================

/// Supervised driver process plus its LIPP channels.
pub struct LippDriver {
    id: u64,
    identity: EquipmentIdentity,
    label: String,
    local: LippAddress,
    probe_address: LippAddress,
    state: Arc<LivenessState>,
    channel: Arc<TransportChannel>,
    probe: Arc<ProbeChannel>,
    correlator: Arc<Correlator>,
    supervisor: Arc<ProcessSupervisor>,
    restart_delay: std::time::Duration,
    cancel: CancellationToken,
    incarnation: AtomicU32,
    incarnation_token: parking_lot::Mutex<CancellationToken>,
    torn_down: AtomicBool,
    events: Option<SlotEventSender>,
    created: DateTime<Utc>,
}

impl fmt::Debug for LippDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LippDriver")
            .field("id", &self.id)
            .field("equipment", &self.label)
            .field("incarnation", &self.incarnation())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl LippDriver {
    /// Bind the sockets and start the first process incarnation.
    ///
    /// Fails when a socket cannot be bound or the process cannot be spawned.
    pub async fn spawn(
        identity: EquipmentIdentity,
        config: &DriverConfig,
        events: Option<SlotEventSender>,
    ) -> UnitResult<Arc<Self>> {
        let label = identity.label();
        let naming = SocketNaming::from_config(config);
        let local = naming.unit(&identity);
        let peer = naming.driver(&identity);
        let probe_address = naming.probe(&identity);

        let socket = DatagramSocket::bind(&local, config.max_message_bytes).await?;
        let probe_socket = DatagramSocket::bind(&probe_address, config.max_message_bytes).await?;

        let cancel = CancellationToken::new();
        let state = Arc::new(LivenessState::new());
        let channel = Arc::new(TransportChannel::new(
            socket,
            peer.clone(),
            label.clone(),
            config.ready_timeout,
            config.response_timeout,
        ));
        let probe = Arc::new(ProbeChannel::new(probe_socket, label.clone(), config.probe_timeout));
        let correlator = Arc::new(Correlator::new(
            channel.clone(),
            state.clone(),
            label.clone(),
            config.lock_timeout,
            cancel.clone(),
        ));
        let command = CommandTemplate::from_config(config).render(&identity, &peer);
        let supervisor = Arc::new(ProcessSupervisor::new(label.clone(), command, config.stop_grace));

        let driver = Arc::new(Self {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            label,
            local,
            probe_address,
            state,
            channel,
            probe,
            correlator,
            supervisor,
            restart_delay: config.restart_delay,
            incarnation_token: parking_lot::Mutex::new(cancel.child_token()),
            cancel,
            incarnation: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
            events,
            created: Utc::now(),
        });

        if let Err(e) = driver.start("construction").await {
            driver.teardown(TeardownReason::Quit).await;
            return Err(e);
        }
        Ok(driver)
    }

    /// Unique id of this driver object.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Equipment label, e.g. `focuser-2`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Process incarnation, starting at 1.
    pub fn incarnation(&self) -> u32 {
        self.incarnation.load(Ordering::Acquire)
    }

    /// Id of the last request issued to the current incarnation.
    pub fn current_request_id(&self) -> u64 {
        self.correlator.current_request_id()
    }

    /// Liveness snapshot.
    pub fn liveness(&self) -> LivenessSnapshot {
        self.state.snapshot()
    }

    /// Process supervisor (command line, pid, start count).
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Whether teardown has begun.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Start a new process incarnation with fresh liveness and numbering.
    ///
    /// Boxed because the exit monitor it spawns calls back into it.
    fn start<'a>(self: &'a Arc<Self>, reason: &'a str) -> BoxFuture<'a, UnitResult<()>> {
        Box::pin(async move {
            if self.is_torn_down() {
                return Err(UnitError::ShuttingDown);
            }
            let token = {
                let mut current = self.incarnation_token.lock();
                current.cancel();
                *current = self.cancel.child_token();
                current.clone()
            };

            self.state.reset();
            self.correlator.reset().await;
            self.channel.drain_stale();

            let child = self.supervisor.start(reason)?;
            let incarnation = self.incarnation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(equipment = %self.label, incarnation, "incarnation started");

            tokio::spawn(ready_waiter(Arc::downgrade(self), self.correlator.clone(), token.clone()));
            tokio::spawn(exit_monitor(Arc::downgrade(self), self.supervisor.clone(), child));
            tokio::spawn(probe_monitor(
                Arc::downgrade(self),
                self.probe.clone(),
                self.state.clone(),
                token,
            ));
            Ok(())
        })
    }

    /// Stop everything, once. Later calls return immediately.
    pub async fn teardown(&self, reason: TeardownReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(equipment = %self.label, %reason, "already torn down");
            return;
        }
        tracing::info!(equipment = %self.label, %reason, "tearing down driver");
        self.cancel.cancel();
        self.supervisor.stop(&reason.to_string()).await;
        self.channel.close();
        self.probe.close();

        if reason.wants_replacement() {
            if let Some(events) = &self.events {
                let event = SlotEvent {
                    identity: self.identity,
                    driver_id: self.id,
                    reason,
                };
                if events.send(event).is_err() {
                    tracing::debug!(equipment = %self.label, "slot manager gone");
                }
            }
        }
    }

    /// Ask the process to quit, then stop it.
    pub async fn quit(&self) {
        if self.is_torn_down() {
            return;
        }
        if self.state.detected() {
            self.supervisor.expect_exit();
            if let Err(e) = self.correlator.notify("quit").await {
                tracing::warn!(equipment = %self.label, error = %e, "quit request failed");
            }
        }
        self.teardown(TeardownReason::Quit).await;
    }

    async fn call(&self, method: &str, params: Params) -> UnitResult<Value> {
        if self.is_torn_down() {
            return Err(UnitError::ShuttingDown);
        }
        self.correlator.call(method, params).await
    }
}

// =============================================================================
// Monitors
// =============================================================================

async fn ready_waiter(driver: Weak<LippDriver>, correlator: Arc<Correlator>, token: CancellationToken) {
    let outcome = tokio::select! {
        _ = token.cancelled() => return,
        outcome = correlator.await_ready() => outcome,
    };
    let Some(driver) = driver.upgrade() else {
        return;
    };
    match outcome {
        Ok(Detection::Detected) => {
            tracing::info!(equipment = %driver.label, "hardware detected");
        }
        Ok(Detection::NotDetected) => {
            tracing::info!(equipment = %driver.label, "hardware not detected");
            if driver.identity.kind.is_singleton() {
                driver.teardown(TeardownReason::NotDetected).await;
            }
        }
        Err(UnitError::ShuttingDown) => {}
        Err(UnitError::Timeout { waited, .. }) => {
            tracing::warn!(
                equipment = %driver.label,
                ?waited,
                "no ready packet, calls will report not-detected"
            );
        }
        Err(e) => {
            tracing::error!(equipment = %driver.label, error = %e, "bad ready packet");
        }
    }
}

async fn exit_monitor(
    driver: Weak<LippDriver>,
    supervisor: Arc<ProcessSupervisor>,
    child: tokio::process::Child,
) {
    let outcome = supervisor.wait_exit(child).await;
    if matches!(outcome, ExitOutcome::Planned(_)) {
        return;
    }
    let Some(driver) = driver.upgrade() else {
        return;
    };
    if driver.is_torn_down() {
        return;
    }

    if driver.events.is_some() {
        driver.teardown(TeardownReason::ProcessExited).await;
        return;
    }

    // Standalone: restart in place after a pause.
    tokio::select! {
        _ = driver.cancel.cancelled() => return,
        _ = tokio::time::sleep(driver.restart_delay) => {}
    }
    if let Err(e) = driver.start("process exited").await {
        tracing::error!(equipment = %driver.label, error = %e, "restart failed");
    }
}

async fn probe_monitor(
    driver: Weak<LippDriver>,
    probe: Arc<ProbeChannel>,
    state: Arc<LivenessState>,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => return,
            received = probe.receive() => received,
        };
        match received {
            Ok(message) => {
                tracing::trace!(answers = ?message.answers_to_probe, "probe");
                state.record_probe(message.answers_to_probe);
            }
            Err(UnitError::Timeout { waited, .. }) => {
                if !state.detected() {
                    continue;
                }
                if let Some(driver) = driver.upgrade() {
                    tracing::warn!(equipment = %driver.label, ?waited, "probe silence while detected");
                    driver.teardown(TeardownReason::ProbeTimeout).await;
                }
                return;
            }
            Err(UnitError::ShuttingDown) => return,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring bad probe datagram");
            }
        }
    }
}

// =============================================================================
// EquipmentDriver
// =============================================================================

#[async_trait]
impl EquipmentDriver for LippDriver {
    fn identity(&self) -> EquipmentIdentity {
        self.identity
    }

    async fn get(&self, method: &str, params: Params) -> UnitResult<Value> {
        self.call(method, params).await
    }

    async fn put(&self, method: &str, params: Params) -> UnitResult<Value> {
        self.call(method, params).await
    }

    fn detected(&self) -> bool {
        self.state.detected()
    }

    fn responding(&self) -> bool {
        self.state.responding().is_true()
    }

    fn last_response(&self) -> Option<DateTime<Utc>> {
        self.state.snapshot().last_response
    }

    fn info(&self) -> Value {
        json!({
            "Type": "LIPP Driver",
            "Equipment": self.label,
            "Socket": self.local.to_string(),
            "Peer": self.channel.peer().to_string(),
            "Probe": self.probe_address.to_string(),
            "Command": self.supervisor.command().to_string(),
            "Created": self.created,
        })
    }

    fn status(&self) -> Value {
        let mut status = self.state.snapshot().to_json();
        status["Pid"] = json!(self.supervisor.pid());
        status["Incarnation"] = json!(self.incarnation());
        status["RequestId"] = json!(self.current_request_id());
        status["TornDown"] = json!(self.is_torn_down());
        status
    }

    async fn shutdown(&self) {
        self.quit().await;
    }
}
