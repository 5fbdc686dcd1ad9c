//! Equipment identity and site topology.
//!
//! A LAST unit is one half of a dual-mount rig: the host whose name ends in
//! `e` drives telescopes 1 and 2, the host ending in `w` drives 3 and 4. The
//! mount is a singleton (id 0) shared by the pair.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UnitError;

/// Hostname used when the system hostname is not a LAST host.
pub const DEFAULT_HOSTNAME: &str = "last07w";

/// Number of slots in a per-kind equipment array (index 0 unused for multi-instance kinds).
pub const SLOT_COUNT: usize = 5;

// =============================================================================
// Equipment kind
// =============================================================================

/// Kind of equipment served by a driver slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equipment {
    /// The (single) telescope mount
    Mount,
    /// Per-telescope camera
    Camera,
    /// Per-telescope focuser
    Focuser,
    /// Power switch
    Pswitch,
    /// Test equipment used by the driver's self tests
    Test,
}

impl Equipment {
    /// Lower-case name, used in socket names, URLs and process arguments.
    pub fn name(&self) -> &'static str {
        match self {
            Equipment::Mount => "mount",
            Equipment::Camera => "camera",
            Equipment::Focuser => "focuser",
            Equipment::Pswitch => "pswitch",
            Equipment::Test => "test",
        }
    }

    /// Whether only one instance exists per rig.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Equipment::Mount)
    }

    /// Ids this kind may legally take, independent of site side.
    pub fn valid_ids(&self) -> &'static [u8] {
        match self {
            Equipment::Mount => &[0],
            Equipment::Camera | Equipment::Focuser | Equipment::Test => &[1, 2, 3, 4],
            Equipment::Pswitch => &[1, 2],
        }
    }
}

impl fmt::Display for Equipment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Equipment {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mount" => Ok(Equipment::Mount),
            "camera" => Ok(Equipment::Camera),
            "focuser" => Ok(Equipment::Focuser),
            "pswitch" => Ok(Equipment::Pswitch),
            "test" => Ok(Equipment::Test),
            other => Err(UnitError::InvalidEquipment(format!(
                "unknown equipment kind '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Immutable (kind, id) pair naming one equipment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EquipmentIdentity {
    /// Equipment kind
    pub kind: Equipment,
    /// 0 for singletons, otherwise 1..=4
    pub id: u8,
}

impl EquipmentIdentity {
    /// Build an identity, rejecting ids the kind cannot take.
    pub fn new(kind: Equipment, id: u8) -> Result<Self, UnitError> {
        if !kind.valid_ids().contains(&id) {
            return Err(UnitError::InvalidEquipment(format!(
                "invalid id {} for '{}', must be one of {:?}",
                id,
                kind,
                kind.valid_ids()
            )));
        }
        Ok(Self { kind, id })
    }

    /// The mount identity.
    pub fn mount() -> Self {
        Self {
            kind: Equipment::Mount,
            id: 0,
        }
    }

    /// Label used in logs and errors: `mount`, `focuser-2`.
    pub fn label(&self) -> String {
        if self.id == 0 {
            self.kind.name().to_string()
        } else {
            format!("{}-{}", self.kind.name(), self.id)
        }
    }
}

impl fmt::Display for EquipmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// =============================================================================
// Site side
// =============================================================================

/// Which half of the rig this unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Host name ends in `e`
    East,
    /// Host name ends in `w`
    West,
}

impl Side {
    /// Side letter as it appears at the end of host names.
    pub fn letter(&self) -> char {
        match self {
            Side::East => 'e',
            Side::West => 'w',
        }
    }

    /// The other side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::East => Side::West,
            Side::West => Side::East,
        }
    }

    /// Telescope ids driven locally on this side.
    pub fn equipment_ids(&self) -> [u8; 2] {
        match self {
            Side::East => [1, 2],
            Side::West => [3, 4],
        }
    }
}

/// Host topology of this unit and its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    hostname: String,
    side: Side,
}

impl Site {
    /// Derive the site from a host name such as `last07e`.
    pub fn from_hostname(hostname: &str) -> Result<Self, UnitError> {
        let side = match hostname.chars().last() {
            Some('e') => Side::East,
            Some('w') => Side::West,
            _ => {
                return Err(UnitError::Configuration(format!(
                    "invalid hostname '{}', must end in 'e' or 'w'",
                    hostname
                )))
            }
        };
        Ok(Self {
            hostname: hostname.to_string(),
            side,
        })
    }

    /// Resolve the site from an optional override, the system host name, or
    /// [`DEFAULT_HOSTNAME`] when the system is not a LAST host.
    pub fn detect(override_hostname: Option<&str>) -> Result<Self, UnitError> {
        if let Some(name) = override_hostname {
            return Self::from_hostname(name);
        }
        let system = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        if system.starts_with("last") {
            Self::from_hostname(&system)
        } else {
            tracing::debug!(hostname = %system, fallback = DEFAULT_HOSTNAME, "not a LAST host");
            Self::from_hostname(DEFAULT_HOSTNAME)
        }
    }

    /// This unit's host name.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// This unit's side.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Host name of the other unit in the pair: trailing letter flipped.
    pub fn peer_hostname(&self) -> String {
        let mut peer = self.hostname.clone();
        peer.pop();
        peer.push(self.side.opposite().letter());
        peer
    }

    /// Whether the given identity is driven by a local process on this side.
    pub fn is_local(&self, identity: &EquipmentIdentity) -> bool {
        identity.kind.is_singleton() || self.side.equipment_ids().contains(&identity.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_hostname_flips_trailing_letter() {
        let east = Site::from_hostname("last07e").unwrap();
        assert_eq!(east.side(), Side::East);
        assert_eq!(east.peer_hostname(), "last07w");

        let west = Site::from_hostname("last12w").unwrap();
        assert_eq!(west.peer_hostname(), "last12e");
    }

    #[test]
    fn rejects_hostname_without_side() {
        assert!(Site::from_hostname("last07").is_err());
    }

    #[test]
    fn override_wins() {
        let site = Site::detect(Some("last02e")).unwrap();
        assert_eq!(site.hostname(), "last02e");
    }

    #[test]
    fn local_ids_follow_side() {
        let site = Site::from_hostname("last07e").unwrap();
        let f1 = EquipmentIdentity::new(Equipment::Focuser, 1).unwrap();
        let f3 = EquipmentIdentity::new(Equipment::Focuser, 3).unwrap();
        assert!(site.is_local(&f1));
        assert!(!site.is_local(&f3));
        assert!(site.is_local(&EquipmentIdentity::mount()));
    }

    #[test]
    fn identity_validation() {
        assert!(EquipmentIdentity::new(Equipment::Camera, 0).is_err());
        assert!(EquipmentIdentity::new(Equipment::Camera, 5).is_err());
        assert!(EquipmentIdentity::new(Equipment::Mount, 1).is_err());
        assert!(EquipmentIdentity::new(Equipment::Pswitch, 3).is_err());
        assert_eq!(
            EquipmentIdentity::new(Equipment::Focuser, 2)
                .unwrap()
                .label(),
            "focuser-2"
        );
        assert_eq!(EquipmentIdentity::mount().label(), "mount");
    }

    #[test]
    fn parses_kind_case_insensitively() {
        assert_eq!("Focuser".parse::<Equipment>().unwrap(), Equipment::Focuser);
        assert!("telescope".parse::<Equipment>().is_err());
    }
}
