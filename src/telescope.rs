//! A telescope: one focuser and one camera sharing an optical tube.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::driver_interface::EquipmentDriver;

/// Pairing of the focuser and camera with the same id.
pub struct Telescope {
    id: u8,
    focuser: Option<Arc<dyn EquipmentDriver>>,
    camera: Option<Arc<dyn EquipmentDriver>>,
}

impl Telescope {
    /// Telescope `id` over whatever currently occupies its slots.
    pub fn new(
        id: u8,
        focuser: Option<Arc<dyn EquipmentDriver>>,
        camera: Option<Arc<dyn EquipmentDriver>>,
    ) -> Self {
        Self { id, focuser, camera }
    }

    /// Telescope id, 1-4.
    pub fn id(&self) -> u8 {
        self.id
    }

    fn both(&self, f: impl Fn(&dyn EquipmentDriver) -> bool) -> bool {
        match (&self.focuser, &self.camera) {
            (Some(focuser), Some(camera)) => f(focuser.as_ref()) && f(camera.as_ref()),
            _ => false,
        }
    }

    /// Both devices detected.
    pub fn detected(&self) -> bool {
        self.both(|d| d.detected())
    }

    /// Both devices detected and responding.
    pub fn operational(&self) -> bool {
        self.both(|d| d.detected() && d.responding())
    }

    /// Detection summary.
    pub fn status(&self) -> Value {
        json!({
            "detected": self.detected(),
            "operational": self.operational(),
        })
    }

    /// Static description.
    pub fn info(&self) -> Value {
        json!({
            "Equipment": format!("telescope-{}", self.id),
            "Maker": "Celestron",
            "Model": "RASA 11-inch",
        })
    }
}
