//! Capability contract shared by local drivers and peer forwarders.
//!
//! Routers and the unit aggregator hold `Arc<dyn EquipmentDriver>` and never
//! need to know which implementation occupies a slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::equipment::EquipmentIdentity;
use crate::error::UnitResult;

/// Method parameters as sent on the wire.
pub type Params = Map<String, Value>;

/// Equipment access, local or forwarded.
#[async_trait]
pub trait EquipmentDriver: Send + Sync {
    /// Identity served.
    fn identity(&self) -> EquipmentIdentity;

    /// Read-style method call.
    async fn get(&self, method: &str, params: Params) -> UnitResult<Value>;

    /// Write-style method call.
    async fn put(&self, method: &str, params: Params) -> UnitResult<Value>;

    /// Whether the hardware is known to be present.
    fn detected(&self) -> bool;

    /// Whether the last exchange completed in time.
    fn responding(&self) -> bool;

    /// Time of the last successful exchange.
    fn last_response(&self) -> Option<DateTime<Utc>>;

    /// Static description of this driver.
    fn info(&self) -> Value;

    /// Health snapshot.
    fn status(&self) -> Value;

    /// Release resources; the driver accepts no calls afterwards.
    async fn shutdown(&self) {}

    /// Info and health in one object, as reported by unit status.
    fn describe(&self) -> Value {
        json!({
            "Info": self.info(),
            "Health": self.status(),
        })
    }
}
