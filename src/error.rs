//! Custom error types for the unit.
//!
//! This module defines the primary error type, `UnitError`, used by every
//! component that talks to equipment, whether through a local LIPP driver
//! process or through a forwarder to the peer unit. Using the `thiserror`
//! crate, it provides a centralized and consistent way to report failures
//! without letting any of them escape as a crash of the request path.
//!
//! ## Error Hierarchy
//!
//! - **Transport**: `Timeout`, `PeerUnavailable`, `MessageTooLarge`. A receive
//!   timeout is recoverable and only flips the driver's `responding` flag.
//! - **Protocol**: `Protocol` covers a missing or mismatched `RequestId` and
//!   malformed datagrams. These indicate a desynchronized channel.
//! - **Remote**: `Remote` carries the `Error`/`Exception` fields reported by
//!   the driver process itself.
//! - **Process**: `Spawn` is fatal to constructing a driver slot.
//! - **Contention**: `Busy` is reported when the correlator lock could not be
//!   acquired in time; no datagram was sent.
//! - **Detection**: `NotDetected` short-circuits calls to absent hardware.
//!
//! Every variant maps to a stable [`ErrorKind`] label and to the structured
//! JSON body returned to HTTP callers (see [`UnitError::to_body`]).

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::lipp::protocol::RemoteException;

/// Convenience alias for results using the unit error type.
pub type UnitResult<T> = std::result::Result<T, UnitError>;

// =============================================================================
// Error Kinds
// =============================================================================

/// Stable, caller-visible category of a [`UnitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Hardware not detected by the driver process
    NotDetected,
    /// Correlator lock could not be acquired
    Busy,
    /// No response within the receive timeout
    Timeout,
    /// Nobody listening at the driver's address
    PeerUnavailable,
    /// Datagram exceeded the channel bound
    MessageTooLarge,
    /// Correlation or framing violation
    Protocol,
    /// Error reported by the driver process
    Remote,
    /// Driver process could not be started
    Spawn,
    /// HTTP failure talking to the peer unit
    Forwarder,
    /// Invalid equipment identity
    InvalidEquipment,
    /// Invalid configuration
    Configuration,
    /// Operation not allowed in the current activity state
    Refused,
    /// Underlying I/O failure
    Io,
    /// JSON (de)serialization failure
    Json,
    /// The driver is being torn down
    ShuttingDown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::NotDetected => "not_detected",
            ErrorKind::Busy => "busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PeerUnavailable => "peer_unavailable",
            ErrorKind::MessageTooLarge => "message_too_large",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Remote => "remote",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Forwarder => "forwarder",
            ErrorKind::InvalidEquipment => "invalid_equipment",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Refused => "refused",
            ErrorKind::Io => "io",
            ErrorKind::Json => "json",
            ErrorKind::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// UnitError
// =============================================================================

/// Primary error type for equipment access.
#[derive(Error, Debug)]
pub enum UnitError {
    /// The driver reported (or has not yet confirmed) that its hardware is present.
    #[error("{equipment} is not-detected")]
    NotDetected {
        /// Equipment label, e.g. `focuser-2`
        equipment: String,
    },

    /// Another request held the driver for longer than the lock timeout.
    #[error("{equipment} is busy (lock not acquired within {waited:?})")]
    Busy {
        /// Equipment label
        equipment: String,
        /// How long the caller waited for the lock
        waited: Duration,
    },

    /// The driver did not answer within the receive timeout.
    #[error("{equipment} did not respond within {waited:?}")]
    Timeout {
        /// Equipment label
        equipment: String,
        /// Receive timeout in force
        waited: Duration,
    },

    /// No listener bound at the driver's address.
    #[error("{equipment}: no driver listening at '{address}'")]
    PeerUnavailable {
        /// Equipment label
        equipment: String,
        /// Address the datagram was sent to
        address: String,
    },

    /// Datagram exceeds the channel's maximum message size.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Size of the offending message
        size: usize,
        /// Channel bound
        max: usize,
    },

    /// Correlation or framing violation on the transport channel.
    #[error("{equipment} protocol error: {message}")]
    Protocol {
        /// Equipment label
        equipment: String,
        /// Description of the violation
        message: String,
    },

    /// The driver process answered with an error or exception.
    #[error("{equipment} remote error: {error}")]
    Remote {
        /// Equipment label
        equipment: String,
        /// `Error` field, or the exception message when only an exception was sent
        error: String,
        /// Structured exception detail, when present
        exception: Option<Box<RemoteException>>,
    },

    /// The driver process could not be started.
    #[error("{equipment}: failed to start driver process: {message}")]
    Spawn {
        /// Equipment label
        equipment: String,
        /// Underlying cause
        message: String,
    },

    /// HTTP failure while forwarding to the peer unit.
    #[error("{equipment} forwarder error: {message}")]
    Forwarder {
        /// Equipment label
        equipment: String,
        /// Underlying cause
        message: String,
    },

    /// Equipment kind/id combination is not valid on this unit.
    #[error("Invalid equipment: {0}")]
    InvalidEquipment(String),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The unit refused the operation in its current state.
    #[error("{equipment} refused: {message}")]
    Refused {
        /// Equipment label, or `unit`
        equipment: String,
        /// Why
        message: String,
    },

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The driver is being torn down and accepts no more calls.
    #[error("driver is shutting down")]
    ShuttingDown,
}

impl UnitError {
    /// Stable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitError::NotDetected { .. } => ErrorKind::NotDetected,
            UnitError::Busy { .. } => ErrorKind::Busy,
            UnitError::Timeout { .. } => ErrorKind::Timeout,
            UnitError::PeerUnavailable { .. } => ErrorKind::PeerUnavailable,
            UnitError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            UnitError::Protocol { .. } => ErrorKind::Protocol,
            UnitError::Remote { .. } => ErrorKind::Remote,
            UnitError::Spawn { .. } => ErrorKind::Spawn,
            UnitError::Forwarder { .. } => ErrorKind::Forwarder,
            UnitError::InvalidEquipment(_) => ErrorKind::InvalidEquipment,
            UnitError::Configuration(_) => ErrorKind::Configuration,
            UnitError::Refused { .. } => ErrorKind::Refused,
            UnitError::Io(_) => ErrorKind::Io,
            UnitError::Json(_) => ErrorKind::Json,
            UnitError::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Busy | ErrorKind::Timeout | ErrorKind::PeerUnavailable | ErrorKind::Forwarder
        )
    }

    /// Structured error object handed to callers.
    ///
    /// Shape: `{"Value": null, "Error": "<message>", "ErrorKind": "<kind>"}`,
    /// plus an `Exception` block for remote exceptions.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "Value": Value::Null,
            "Error": self.to_string(),
            "ErrorKind": self.kind().to_string(),
        });
        if let UnitError::Remote {
            exception: Some(exception),
            ..
        } = self
        {
            if let Ok(ex) = serde_json::to_value(exception.as_ref()) {
                body["Exception"] = ex;
            }
        }
        body
    }
}
