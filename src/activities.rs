//! Activity bit sets.
//!
//! An idle component has no bits set. Activities are started and ended
//! independently, so several can be in progress at once.

use bitflags::bitflags;
use parking_lot::RwLock;
use serde_json::Value;

bitflags! {
    /// What the unit as a whole is doing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnitActivities: u32 {
        /// Coming up
        const STARTING_UP = 1 << 0;
        /// Going down
        const SHUTTING_DOWN = 1 << 1;
        /// Mount slew issued by the unit
        const SLEWING = 1 << 2;
        /// Autofocus run
        const AUTOFOCUSING = 1 << 3;
        /// Exposure in progress
        const EXPOSING = 1 << 4;
        /// Abort in progress
        const ABORTING = 1 << 5;
    }
}

bitflags! {
    /// Mount activities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountActivities: u32 {
        /// Coming up
        const STARTING_UP = 1 << 0;
        /// Going down
        const SHUTTING_DOWN = 1 << 1;
        /// Slewing
        const SLEWING = 1 << 2;
        /// Parking
        const PARKING = 1 << 3;
    }
}

bitflags! {
    /// Camera activities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CameraActivities: u32 {
        /// Coming up
        const STARTING_UP = 1 << 0;
        /// Going down
        const SHUTTING_DOWN = 1 << 1;
        /// Cooling the sensor
        const COOLING_DOWN = 1 << 2;
        /// Warming the sensor
        const WARMING_UP = 1 << 3;
        /// Exposing
        const EXPOSING = 1 << 4;
    }
}

bitflags! {
    /// Focuser activities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FocuserActivities: u32 {
        /// Moving
        const MOVING = 1 << 0;
    }
}

/// Thread-safe activity set.
#[derive(Debug, Default)]
pub struct Activities<F> {
    current: RwLock<F>,
}

impl<F> Activities<F>
where
    F: bitflags::Flags + Copy,
{
    /// Idle set.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(F::empty()),
        }
    }

    /// Add `activities`; returns whether any of them was already in progress.
    pub fn start(&self, activities: F) -> bool {
        let mut current = self.current.write();
        let was_active = current.intersects(activities);
        current.insert(activities);
        was_active
    }

    /// Remove `activities`.
    pub fn end(&self, activities: F) {
        self.current.write().remove(activities);
    }

    /// Whether any of `activities` is in progress.
    pub fn is_active(&self, activities: F) -> bool {
        self.current.read().intersects(activities)
    }

    /// Whether nothing is in progress.
    pub fn is_idle(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Current set.
    pub fn current(&self) -> F {
        *self.current.read()
    }

    /// Names of the activities in progress, as reported by status.
    pub fn to_json(&self) -> Value {
        let current = self.current();
        Value::Array(
            current
                .iter_names()
                .map(|(name, _)| Value::String(name.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_end_are_independent() {
        let a = Activities::<UnitActivities>::new();
        assert!(a.is_idle());
        a.start(UnitActivities::SLEWING);
        a.start(UnitActivities::EXPOSING);
        assert!(a.is_active(UnitActivities::SLEWING));
        a.end(UnitActivities::SLEWING);
        assert!(!a.is_active(UnitActivities::SLEWING));
        assert!(a.is_active(UnitActivities::EXPOSING));
        assert!(!a.is_idle());
    }

    #[test]
    fn start_reports_activity_already_in_progress() {
        let a = Activities::<UnitActivities>::new();
        assert!(!a.start(UnitActivities::SLEWING));
        assert!(a.start(UnitActivities::SLEWING));
        assert!(!a.start(UnitActivities::EXPOSING));
        a.end(UnitActivities::SLEWING);
        assert!(!a.start(UnitActivities::SLEWING));
    }

    #[test]
    fn names_in_status() {
        let a = Activities::<UnitActivities>::new();
        a.start(UnitActivities::ABORTING);
        assert_eq!(a.to_json(), serde_json::json!(["ABORTING"]));
    }
}
