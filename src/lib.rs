//! # LAST Unit Control Plane
//!
//! A LAST unit is the host-side controller of one half of a dual-mount
//! telescope rig. It exposes every piece of equipment (the mount, and per
//! telescope a focuser and a camera) over HTTP. Equipment driven on this host
//! is reached through supervised driver processes speaking LIPP, a JSON
//! protocol over local datagram sockets; equipment driven by the peer host is
//! reached through HTTP forwarders.
//!
//! ## Crate Structure
//!
//! - **`lipp`**: the driver-process side. Wire types, socket naming, the
//!   datagram transport and probe channels, request/response correlation,
//!   process supervision and the [`lipp::LippDriver`] that binds them together.
//! - **`driver_interface`**: the [`driver_interface::EquipmentDriver`] trait
//!   implemented by local drivers and forwarders alike.
//! - **`forwarder`**: HTTP forwarding to the peer unit.
//! - **`slots`**: one slot per equipment identity, and the manager that morphs
//!   an absent mount into a forwarder or resurrects crashed drivers.
//! - **`unit`**, **`telescope`**, **`activities`**: aggregate status and
//!   unit-level operations (abort, slew, quit).
//! - **`server`**: the axum HTTP surface.
//! - **`config`**, **`logging`**, **`error`**, **`equipment`**: ambient support.

pub mod activities;
pub mod config;
pub mod driver_interface;
pub mod equipment;
pub mod error;
pub mod forwarder;
pub mod lipp;
pub mod logging;
pub mod server;
pub mod slots;
pub mod telescope;
pub mod unit;

pub use driver_interface::EquipmentDriver;
pub use equipment::{Equipment, EquipmentIdentity, Site};
pub use error::{UnitError, UnitResult};
