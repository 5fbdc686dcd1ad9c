//! Driver liveness state.
//!
//! Tracks two orthogonal axes:
//! - the detection phase, `Initializing -> {Detected, NotDetected}`, set once
//!   per process incarnation by the ready packet
//! - responsiveness, flipped on every receive outcome
//!
//! Writers are the monitor tasks and the request path; every update is a
//! plain last-writer-wins store under a short lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};

use super::protocol::Detection;

/// Boolean with an explicit "not known yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TriState {
    /// Not yet observed
    #[default]
    Unknown,
    /// Observed true
    True,
    /// Observed false
    False,
}

impl TriState {
    /// Only [`TriState::True`] counts as true.
    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    /// `null`, `true` or `false`.
    pub fn to_json(self) -> Value {
        match self {
            TriState::Unknown => Value::Null,
            TriState::True => Value::Bool(true),
            TriState::False => Value::Bool(false),
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map_or(TriState::Unknown, TriState::from)
    }
}

/// Detection phase of the current process incarnation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DriverPhase {
    /// Waiting for the ready packet
    #[default]
    Initializing,
    /// Hardware present
    Detected,
    /// Hardware absent
    NotDetected,
}

impl DriverPhase {
    /// Detection as a tri-state.
    pub fn detected(self) -> TriState {
        match self {
            DriverPhase::Initializing => TriState::Unknown,
            DriverPhase::Detected => TriState::True,
            DriverPhase::NotDetected => TriState::False,
        }
    }
}

/// Point-in-time copy of the liveness state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessSnapshot {
    /// Detection phase
    pub phase: DriverPhase,
    /// Outcome of the last exchange
    pub responding: TriState,
    /// Last successful receive
    pub last_response: Option<DateTime<Utc>>,
    /// Last probe message
    pub last_probe: Option<DateTime<Utc>>,
    /// Value carried by the last probe message
    pub answers_to_probe: TriState,
}

impl LivenessSnapshot {
    /// Health block reported by `status()`.
    pub fn to_json(&self) -> Value {
        json!({
            "Phase": format!("{:?}", self.phase),
            "Detected": self.phase.detected().to_json(),
            "Responding": self.responding.to_json(),
            "LastResponse": self.last_response,
            "LastProbe": self.last_probe,
            "AnswersToProbe": self.answers_to_probe.to_json(),
        })
    }
}

/// Shared liveness state of one driver.
#[derive(Debug, Default)]
pub struct LivenessState {
    inner: RwLock<LivenessSnapshot>,
}

impl LivenessState {
    /// Fresh state: initializing, responsiveness unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> LivenessSnapshot {
        *self.inner.read()
    }

    /// Current phase.
    pub fn phase(&self) -> DriverPhase {
        self.inner.read().phase
    }

    /// Whether the hardware is known to be present.
    pub fn detected(&self) -> bool {
        self.phase() == DriverPhase::Detected
    }

    /// Responsiveness of the last exchange.
    pub fn responding(&self) -> TriState {
        self.inner.read().responding
    }

    /// Apply the ready packet. Returns `false` if the phase was already decided.
    pub fn mark_ready(&self, detection: Detection) -> bool {
        let mut state = self.inner.write();
        if state.phase != DriverPhase::Initializing {
            return false;
        }
        state.phase = match detection {
            Detection::Detected => DriverPhase::Detected,
            Detection::NotDetected => DriverPhase::NotDetected,
        };
        true
    }

    /// A datagram arrived in time.
    pub fn record_response(&self) {
        let mut state = self.inner.write();
        state.responding = TriState::True;
        state.last_response = Some(Utc::now());
    }

    /// A receive timed out. Detection is left alone.
    pub fn record_timeout(&self) {
        self.inner.write().responding = TriState::False;
    }

    /// A probe message arrived.
    pub fn record_probe(&self, answers: Option<bool>) {
        let mut state = self.inner.write();
        state.last_probe = Some(Utc::now());
        state.answers_to_probe = answers.into();
    }

    /// Back to the initial state for a new process incarnation.
    pub fn reset(&self) {
        *self.inner.write() = LivenessSnapshot::default();
    }
}
