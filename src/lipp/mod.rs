//! LIPP: the LAST inter-process protocol between the unit and its driver processes.
//!
//! Layers, leaves first:
//! - [`protocol`]: JSON wire types
//! - [`address`]: socket naming
//! - [`transport`] / [`probe`]: datagram channels
//! - [`state`]: liveness bookkeeping
//! - [`correlator`]: one-at-a-time request/response matching
//! - [`supervisor`]: the external process
//! - [`driver`]: everything above bound to one equipment instance

pub mod address;
pub mod correlator;
pub mod driver;
pub mod probe;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use address::{LippAddress, Namespace, SocketNaming};
pub use driver::{LippDriver, SlotEvent, SlotEventSender, TeardownReason};
pub use protocol::{Detection, ProbeMessage, RemoteException, Request, Response};
pub use state::{DriverPhase, TriState};
