//! The unit: aggregate view and control over every slot.
//!
//! Status fans out one live `status` call per occupied slot and joins them
//! with a per-device timeout; a device that fails or times out contributes
//! `null` instead of holding up the aggregate.

use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activities::{Activities, MountActivities, UnitActivities};
use crate::config::UnitSettings;
use crate::driver_interface::{EquipmentDriver, Params};
use crate::equipment::{Equipment, EquipmentIdentity};
use crate::error::{UnitError, UnitResult};
use crate::slots::SlotRegistry;
use crate::telescope::Telescope;

/// Method asked of every device during aggregation.
pub const STATUS_METHOD: &str = "status";

/// Whether a mount status value says it is slewing; `None` when it does not say.
pub fn mount_is_slewing(status: &Value) -> Option<bool> {
    match status {
        Value::String(s) => Some(s.eq_ignore_ascii_case("slewing")),
        Value::Object(o) => {
            let activities = o.get("Activities").or_else(|| o.get("activities"))?;
            match activities {
                Value::Number(n) => {
                    let bits = u32::try_from(n.as_u64()?).ok()?;
                    Some(MountActivities::from_bits_truncate(bits).contains(MountActivities::SLEWING))
                }
                Value::String(s) => Some(s.to_ascii_lowercase().contains("slewing")),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Top-level aggregator over a [`SlotRegistry`].
pub struct Unit {
    registry: Arc<SlotRegistry>,
    activities: Activities<UnitActivities>,
    settings: UnitSettings,
    cancel: CancellationToken,
}

impl Unit {
    /// Unit over `registry`.
    pub fn new(registry: Arc<SlotRegistry>, settings: UnitSettings) -> Arc<Self> {
        Arc::new(Self {
            registry,
            activities: Activities::new(),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// The slots this unit aggregates.
    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    /// Unit activity set.
    pub fn activities(&self) -> &Activities<UnitActivities> {
        &self.activities
    }

    fn mount(&self) -> UnitResult<Arc<dyn EquipmentDriver>> {
        self.registry.get(&EquipmentIdentity::mount())
    }

    async fn live_status(&self, driver: &Arc<dyn EquipmentDriver>) -> Value {
        let label = driver.identity().label();
        match tokio::time::timeout(
            self.settings.status_timeout,
            driver.get(STATUS_METHOD, Params::new()),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::debug!(equipment = %label, error = %e, "no status");
                Value::Null
            }
            Err(_) => {
                tracing::warn!(equipment = %label, timeout = ?self.settings.status_timeout, "status timed out");
                Value::Null
            }
        }
    }

    async fn device_entry(&self, identity: EquipmentIdentity) -> Value {
        match self.registry.state(&identity) {
            Some(state) => {
                let driver = state.driver();
                let status = self.live_status(&driver).await;
                json!({
                    "Info": driver.info(),
                    "Health": driver.status(),
                    "Status": status,
                })
            }
            None => json!({
                "Info": { "Equipment": identity.label() },
                "Health": Value::Null,
                "Status": Value::Null,
            }),
        }
    }

    /// Aggregate status of every device and telescope.
    pub async fn status(&self) -> Value {
        let identities = self.registry.identities();
        let entries = join_all(identities.iter().map(|&id| self.device_entry(id))).await;

        let mut mount = Value::Null;
        let mut focusers = Vec::new();
        let mut cameras = Vec::new();
        for (identity, entry) in identities.iter().zip(entries) {
            match identity.kind {
                Equipment::Mount => mount = entry,
                Equipment::Focuser => focusers.push(entry),
                Equipment::Camera => cameras.push(entry),
                Equipment::Pswitch | Equipment::Test => {}
            }
        }

        let focuser_slots = self.registry.of_kind(Equipment::Focuser);
        let camera_slots = self.registry.of_kind(Equipment::Camera);
        let telescopes: Vec<Value> = focuser_slots
            .into_iter()
            .map(|(identity, focuser)| {
                let camera = camera_slots
                    .iter()
                    .find(|(c, _)| c.id == identity.id)
                    .and_then(|(_, c)| c.clone());
                let telescope = Telescope::new(identity.id, focuser, camera);
                json!({
                    "Info": telescope.info(),
                    "Status": telescope.status(),
                })
            })
            .collect();

        json!({
            "Activities": self.activities.to_json(),
            "Devices": {
                "Mount": mount,
                "Focusers": focusers,
                "Cameras": cameras,
            },
            "Telescopes": telescopes,
        })
    }

    /// Abort the mount, then every camera, then every focuser.
    ///
    /// Returns the per-device outcome; individual failures do not stop the sweep.
    pub async fn abort(&self) -> Value {
        self.activities.start(UnitActivities::ABORTING);
        tracing::info!("aborting");

        let mut outcome = Map::new();
        let outcome_of = |result: UnitResult<Value>| match result {
            Ok(_) => Value::String("ok".into()),
            Err(e) => Value::String(e.to_string()),
        };

        let mount_result = match self.mount() {
            Ok(mount) => mount.put("abort", Params::new()).await,
            Err(e) => Err(e),
        };
        outcome.insert("mount".into(), outcome_of(mount_result));

        for kind in [Equipment::Camera, Equipment::Focuser] {
            let drivers: Vec<_> = self
                .registry
                .of_kind(kind)
                .into_iter()
                .filter_map(|(identity, driver)| driver.map(|d| (identity, d)))
                .collect();
            let results = join_all(drivers.iter().map(|(_, d)| d.put("abort", Params::new()))).await;
            for ((identity, _), result) in drivers.iter().zip(results) {
                outcome.insert(identity.label(), outcome_of(result));
            }
        }

        self.activities.end(UnitActivities::SLEWING);
        self.activities.end(UnitActivities::ABORTING);
        Value::Object(outcome)
    }

    /// Slew the mount, refusing while a unit slew is already in progress.
    pub async fn slew_to_coordinates(
        &self,
        primary: f64,
        secondary: f64,
        coord_type: &str,
    ) -> UnitResult<Value> {
        let mount = self.mount()?;
        if self.activities.start(UnitActivities::SLEWING) {
            return Err(UnitError::Refused {
                equipment: "unit".into(),
                message: "already slewing".into(),
            });
        }
        tracing::info!(primary, secondary, coord_type, "starting slew");

        let mut params = Params::new();
        params.insert("a1".into(), json!(primary));
        params.insert("a2".into(), json!(secondary));
        params.insert("coordtype".into(), json!(coord_type));
        match mount.put("goTo", params).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.activities.end(UnitActivities::SLEWING);
                Err(e)
            }
        }
    }

    /// One bookkeeping pass: end `SLEWING` once the mount stops slewing.
    pub async fn on_timer(&self) {
        if !self.activities.is_active(UnitActivities::SLEWING) {
            return;
        }
        let Ok(mount) = self.mount() else {
            return;
        };
        let status = self.live_status(&mount).await;
        if mount_is_slewing(&status) == Some(false) {
            tracing::info!("mount arrived, ending slew");
            self.activities.end(UnitActivities::SLEWING);
        }
    }

    /// Run [`Unit::on_timer`] every `activity_poll` until [`Unit::quit`].
    pub fn spawn_activity_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let unit = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(unit.settings.activity_poll.max(Duration::from_millis(10)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = unit.cancel.cancelled() => break,
                    _ = interval.tick() => unit.on_timer().await,
                }
            }
        })
    }

    /// Stop the timer and quit every local driver.
    pub async fn quit(&self) {
        tracing::info!("unit quitting");
        self.activities.start(UnitActivities::SHUTTING_DOWN);
        self.cancel.cancel();
        self.registry.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderConfig;
    use crate::forwarder::Forwarder;
    use crate::slots::SlotState;
    use axum::extract::{Path, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    #[test]
    fn slewing_detection() {
        assert_eq!(mount_is_slewing(&json!("Slewing")), Some(true));
        assert_eq!(mount_is_slewing(&json!("tracking")), Some(false));
        assert_eq!(mount_is_slewing(&json!({"Activities": 4})), Some(true));
        assert_eq!(mount_is_slewing(&json!({"Activities": 0})), Some(false));
        assert_eq!(mount_is_slewing(&json!(null)), None);
    }

    #[tokio::test]
    async fn empty_registry_status_shape() {
        let unit = Unit::new(Arc::new(SlotRegistry::for_rig()), UnitSettings::default());
        let status = unit.status().await;
        assert_eq!(status["Devices"]["Focusers"].as_array().unwrap().len(), 4);
        assert_eq!(status["Telescopes"].as_array().unwrap().len(), 4);
        assert_eq!(status["Telescopes"][0]["Status"]["detected"], false);
        assert!(status["Devices"]["Mount"]["Status"].is_null());
    }

    #[tokio::test]
    async fn slew_without_mount_fails_and_stays_idle() {
        let unit = Unit::new(Arc::new(SlotRegistry::for_rig()), UnitSettings::default());
        assert!(unit.slew_to_coordinates(1.0, 2.0, "eq").await.is_err());
        assert!(unit.activities().is_idle());
    }

    /// Peer unit stand-in: records calls, serves a settable mount status,
    /// and never answers camera status.
    #[derive(Default)]
    struct FakePeer {
        calls: Mutex<Vec<String>>,
        mount_status: Mutex<Value>,
    }

    async fn handler(
        State(peer): State<Arc<FakePeer>>,
        Path((equipment, id, method)): Path<(String, u8, String)>,
    ) -> Json<Value> {
        peer.calls.lock().push(format!("{}-{}/{}", equipment, id, method));
        if equipment == "camera" && method == STATUS_METHOD {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let value = if equipment == "mount" && method == STATUS_METHOD {
            peer.mount_status.lock().clone()
        } else {
            json!("ok")
        };
        Json(json!({ "Value": value }))
    }

    async fn unit_with_peer() -> (Arc<Unit>, Arc<FakePeer>) {
        let peer = Arc::new(FakePeer::default());
        let app = Router::new()
            .route("/last/api/v1/{equipment}/{id}/{method}", get(handler).put(handler))
            .with_state(peer.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let config = ForwarderConfig {
            port,
            timeout: Duration::from_secs(5),
        };
        let registry = Arc::new(SlotRegistry::for_rig());
        for identity in [
            EquipmentIdentity::mount(),
            EquipmentIdentity::new(Equipment::Focuser, 1).unwrap(),
            EquipmentIdentity::new(Equipment::Camera, 1).unwrap(),
        ] {
            let forwarder = Forwarder::new(identity, "127.0.0.1", &config, "/last/api/v1").unwrap();
            registry
                .replace_slot(&identity, Some(SlotState::RemoteForwarder(Arc::new(forwarder))))
                .await
                .unwrap();
        }
        let settings = UnitSettings {
            status_timeout: Duration::from_millis(300),
            activity_poll: Duration::from_millis(50),
        };
        (Unit::new(registry, settings), peer)
    }

    #[tokio::test]
    async fn status_tolerates_a_stalled_device() {
        let (unit, peer) = unit_with_peer().await;
        *peer.mount_status.lock() = json!("tracking");

        let started = std::time::Instant::now();
        let status = unit.status().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(status["Devices"]["Mount"]["Status"], "tracking");
        assert_eq!(status["Devices"]["Mount"]["Info"]["Type"], "HTTP Forwarder");
        assert_eq!(status["Devices"]["Focusers"][0]["Status"], "ok");
        assert!(status["Devices"]["Cameras"][0]["Status"].is_null());
        assert!(status["Devices"]["Focusers"][1]["Status"].is_null());
    }

    #[tokio::test]
    async fn slew_lifecycle() {
        let (unit, peer) = unit_with_peer().await;
        *peer.mount_status.lock() = json!("slewing");

        unit.slew_to_coordinates(10.0, 20.0, "eq").await.unwrap();
        assert!(unit.activities().is_active(UnitActivities::SLEWING));
        assert!(peer.calls.lock().contains(&"mount-0/goTo".to_string()));

        let err = unit.slew_to_coordinates(1.0, 2.0, "eq").await.unwrap_err();
        assert!(matches!(err, UnitError::Refused { .. }));

        unit.on_timer().await;
        assert!(unit.activities().is_active(UnitActivities::SLEWING));

        *peer.mount_status.lock() = json!("tracking");
        unit.on_timer().await;
        assert!(!unit.activities().is_active(UnitActivities::SLEWING));
    }

    #[tokio::test]
    async fn concurrent_slews_issue_one_goto() {
        let (unit, peer) = unit_with_peer().await;
        *peer.mount_status.lock() = json!("slewing");

        let (a, b) = tokio::join!(
            unit.slew_to_coordinates(10.0, 20.0, "eq"),
            unit.slew_to_coordinates(30.0, 40.0, "eq"),
        );
        let refused = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(UnitError::Refused { .. })))
            .count();
        assert_eq!(refused, 1, "{:?} / {:?}", a, b);
        assert!(a.is_ok() || b.is_ok());

        let gotos = peer.calls.lock().iter().filter(|c| c.ends_with("/goTo")).count();
        assert_eq!(gotos, 1);
        assert!(unit.activities().is_active(UnitActivities::SLEWING));
    }

    #[tokio::test]
    async fn abort_sweeps_mount_then_devices() {
        let (unit, peer) = unit_with_peer().await;
        let outcome = unit.abort().await;
        assert_eq!(outcome["mount"], "ok");
        assert_eq!(outcome["camera-1"], "ok");
        assert_eq!(outcome["focuser-1"], "ok");
        assert!(unit.activities().is_idle());

        let calls = peer.calls.lock().clone();
        assert_eq!(calls[0], "mount-0/abort");
        assert!(calls.contains(&"focuser-1/abort".to_string()));
    }

    #[tokio::test]
    async fn timer_stops_on_quit() {
        let (unit, _peer) = unit_with_peer().await;
        let timer = unit.spawn_activity_timer();
        unit.quit().await;
        tokio::time::timeout(Duration::from_secs(1), timer)
            .await
            .unwrap()
            .unwrap();
        assert!(unit.activities().is_active(UnitActivities::SHUTTING_DOWN));
    }
}
