//! LIPP socket naming.
//!
//! For `focuser-2` with the default prefix:
//!
//! | role   | name                        |
//! |--------|-----------------------------|
//! | unit   | `lipp-unit-focuser-2`       |
//! | driver | `lipp-driver-focuser-2`     |
//! | probe  | `lipp-unit-focuser-2-probe` |
//!
//! In the abstract namespace the name is used as-is (a leading NUL on the
//! wire); in the filesystem namespace it becomes `<dir>/<name>.sock`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::os::unix::net::SocketAddr;
use std::path::PathBuf;

use crate::config::DriverConfig;
use crate::equipment::EquipmentIdentity;

const PROBE_SUFFIX: &str = "-probe";

/// Where socket names live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Linux abstract namespace: nothing on disk, released when the socket closes
    #[default]
    Abstract,
    /// Socket files under a directory
    Filesystem,
}

/// A resolved LIPP socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LippAddress {
    name: String,
    namespace: Namespace,
    dir: PathBuf,
}

impl LippAddress {
    /// Socket name without namespace decoration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of this address.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Path of the socket file, for filesystem addresses.
    pub fn path(&self) -> Option<PathBuf> {
        match self.namespace {
            Namespace::Abstract => None,
            Namespace::Filesystem => Some(self.dir.join(format!("{}.sock", self.name))),
        }
    }

    /// Convert to a std socket address.
    pub fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        match self.path() {
            Some(path) => SocketAddr::from_pathname(path),
            None => abstract_addr(&self.name),
        }
    }

    /// The same address with `from` replaced by `to` in its name.
    fn substitute(&self, from: &str, to: &str) -> Self {
        Self {
            name: self.name.replacen(from, to, 1),
            ..self.clone()
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(name: &str) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket '{}' requires Linux", name),
    ))
}

impl fmt::Display for LippAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "{}", path.display()),
            None => write!(f, "@{}", self.name),
        }
    }
}

/// Derives the three addresses of one equipment instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketNaming {
    prefix: String,
    namespace: Namespace,
    dir: PathBuf,
}

impl SocketNaming {
    /// Naming with explicit parts.
    pub fn new(prefix: impl Into<String>, namespace: Namespace, dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            namespace,
            dir: dir.into(),
        }
    }

    /// Naming taken from the driver configuration.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(
            config.socket_prefix.clone(),
            config.namespace,
            config.socket_dir.clone(),
        )
    }

    /// Address the unit binds for request/response traffic.
    pub fn unit(&self, identity: &EquipmentIdentity) -> LippAddress {
        LippAddress {
            name: format!("{}-unit-{}", self.prefix, identity.label()),
            namespace: self.namespace,
            dir: self.dir.clone(),
        }
    }

    /// Address the driver process binds.
    pub fn driver(&self, identity: &EquipmentIdentity) -> LippAddress {
        self.unit(identity).substitute("-unit-", "-driver-")
    }

    /// Address the unit binds for probe messages.
    pub fn probe(&self, identity: &EquipmentIdentity) -> LippAddress {
        let mut addr = self.unit(identity);
        addr.name.push_str(PROBE_SUFFIX);
        addr
    }

    /// The unit address as seen from a driver-side address (used by the simulator).
    pub fn unit_for_driver(driver: &LippAddress) -> LippAddress {
        driver.substitute("-driver-", "-unit-")
    }

    /// Probe address as seen from a driver-side address.
    pub fn probe_for_driver(driver: &LippAddress) -> LippAddress {
        let mut addr = Self::unit_for_driver(driver);
        addr.name.push_str(PROBE_SUFFIX);
        addr
    }
}
