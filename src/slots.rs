//! Driver slots.
//!
//! The [`SlotRegistry`] holds one cell per equipment identity. Each cell has
//! exactly one occupant, a local LIPP driver or a forwarder to the peer unit.
//! The [`SlotManager`] fills the registry at start-up and reacts to teardown
//! events from local drivers:
//!
//! | slot  | reason                          | new occupant |
//! |-------|---------------------------------|--------------|
//! | mount | not-detected, probe-timeout     | forwarder to the peer host (morph) |
//! | any   | anything else                   | fresh local driver (resurrect) |

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::UnitConfig;
use crate::driver_interface::EquipmentDriver;
use crate::equipment::{Equipment, EquipmentIdentity, Site};
use crate::error::{UnitError, UnitResult};
use crate::forwarder::Forwarder;
use crate::lipp::{LippDriver, SlotEvent, SlotEventSender, TeardownReason};

// =============================================================================
// SlotState
// =============================================================================

/// Occupant of a slot.
#[derive(Debug, Clone)]
pub enum SlotState {
    /// Supervised local driver process
    LocalDriver(Arc<LippDriver>),
    /// Forwarder to the peer unit
    RemoteForwarder(Arc<Forwarder>),
}

impl SlotState {
    /// The occupant as a trait object.
    pub fn driver(&self) -> Arc<dyn EquipmentDriver> {
        match self {
            SlotState::LocalDriver(d) => d.clone(),
            SlotState::RemoteForwarder(f) => f.clone(),
        }
    }

    /// Whether a forwarder occupies the slot.
    pub fn is_forwarder(&self) -> bool {
        matches!(self, SlotState::RemoteForwarder(_))
    }

    /// Local driver, if that is the occupant.
    pub fn local(&self) -> Option<&Arc<LippDriver>> {
        match self {
            SlotState::LocalDriver(d) => Some(d),
            SlotState::RemoteForwarder(_) => None,
        }
    }

    /// Forwarder, if that is the occupant.
    pub fn forwarder(&self) -> Option<&Arc<Forwarder>> {
        match self {
            SlotState::RemoteForwarder(f) => Some(f),
            SlotState::LocalDriver(_) => None,
        }
    }

    async fn teardown(&self, reason: TeardownReason) {
        if let SlotState::LocalDriver(driver) = self {
            driver.teardown(reason).await;
        }
    }
}

// =============================================================================
// SlotRegistry
// =============================================================================

/// Fixed set of slots, one per served identity.
#[derive(Debug)]
pub struct SlotRegistry {
    slots: HashMap<EquipmentIdentity, RwLock<Option<SlotState>>>,
    replacing: Mutex<()>,
}

impl SlotRegistry {
    /// Empty slots for the given identities.
    pub fn new(identities: impl IntoIterator<Item = EquipmentIdentity>) -> Self {
        Self {
            slots: identities
                .into_iter()
                .map(|identity| (identity, RwLock::new(None)))
                .collect(),
            replacing: Mutex::new(()),
        }
    }

    /// The mount plus cameras and focusers 1-4.
    pub fn for_rig() -> Self {
        let mut identities = vec![EquipmentIdentity::mount()];
        for kind in [Equipment::Camera, Equipment::Focuser] {
            identities.extend(
                kind.valid_ids()
                    .iter()
                    .map(|&id| EquipmentIdentity { kind, id }),
            );
        }
        Self::new(identities)
    }

    fn cell(&self, identity: &EquipmentIdentity) -> UnitResult<&RwLock<Option<SlotState>>> {
        self.slots.get(identity).ok_or_else(|| {
            UnitError::InvalidEquipment(format!("no slot for '{}' on this unit", identity))
        })
    }

    /// Served identities, mount first, then by kind and id.
    pub fn identities(&self) -> Vec<EquipmentIdentity> {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Current occupant.
    pub fn state(&self, identity: &EquipmentIdentity) -> Option<SlotState> {
        self.slots.get(identity).and_then(|cell| cell.read().clone())
    }

    /// Current occupant as a driver, or an error naming the missing slot.
    pub fn get(&self, identity: &EquipmentIdentity) -> UnitResult<Arc<dyn EquipmentDriver>> {
        self.cell(identity)?
            .read()
            .as_ref()
            .map(SlotState::driver)
            .ok_or_else(|| UnitError::NotDetected {
                equipment: identity.label(),
            })
    }

    /// Occupants of one kind in id order; empty slots are `None`.
    pub fn of_kind(&self, kind: Equipment) -> Vec<(EquipmentIdentity, Option<Arc<dyn EquipmentDriver>>)> {
        self.identities()
            .into_iter()
            .filter(|identity| identity.kind == kind)
            .map(|identity| (identity, self.state(&identity).map(|s| s.driver())))
            .collect()
    }

    /// Tear down the current occupant, then install `new`.
    pub async fn replace_slot(&self, identity: &EquipmentIdentity, new: Option<SlotState>) -> UnitResult<()> {
        let cell = self.cell(identity)?;
        let _replacing = self.replacing.lock().await;
        let old = cell.read().clone();
        if let Some(old) = old {
            old.teardown(TeardownReason::Replaced).await;
        }
        let kind = match &new {
            Some(SlotState::LocalDriver(_)) => "driver",
            Some(SlotState::RemoteForwarder(_)) => "forwarder",
            None => "empty",
        };
        *cell.write() = new;
        tracing::info!(equipment = %identity, occupant = kind, "slot replaced");
        Ok(())
    }

    /// Shut down every occupant; local drivers quit their processes.
    pub async fn shutdown_all(&self) {
        let drivers: Vec<_> = self
            .identities()
            .iter()
            .filter_map(|identity| self.state(identity))
            .map(|state| state.driver())
            .collect();
        futures::future::join_all(drivers.iter().map(|driver| driver.shutdown())).await;
    }
}

// =============================================================================
// SlotManager
// =============================================================================

/// Fills the registry and decides on morph or resurrection.
pub struct SlotManager {
    registry: Arc<SlotRegistry>,
    site: Site,
    config: Arc<UnitConfig>,
    events: SlotEventSender,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SlotEvent>>>,
}

impl SlotManager {
    /// Manager for `registry` on `site`.
    pub fn new(registry: Arc<SlotRegistry>, site: Site, config: Arc<UnitConfig>) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            site,
            config,
            events,
            receiver: parking_lot::Mutex::new(Some(receiver)),
        })
    }

    /// The managed registry.
    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    /// Sender that local drivers report teardowns on.
    pub fn events(&self) -> SlotEventSender {
        self.events.clone()
    }

    /// Build a local driver reporting to this manager.
    pub async fn local_driver(&self, identity: EquipmentIdentity) -> UnitResult<SlotState> {
        let driver = LippDriver::spawn(identity, &self.config.driver, Some(self.events())).await?;
        Ok(SlotState::LocalDriver(driver))
    }

    /// Build a forwarder to the peer unit.
    pub fn forwarder(&self, identity: EquipmentIdentity) -> UnitResult<SlotState> {
        let forwarder = Forwarder::new(
            identity,
            self.site.peer_hostname(),
            &self.config.forwarder,
            &self.config.server.api_root,
        )?;
        Ok(SlotState::RemoteForwarder(Arc::new(forwarder)))
    }

    /// Local drivers for this side, forwarders for the peer side.
    ///
    /// A driver that cannot be started leaves its slot empty.
    pub async fn populate(&self) {
        for identity in self.registry.identities() {
            let occupant = if self.site.is_local(&identity) {
                self.local_driver(identity).await
            } else {
                self.forwarder(identity)
            };
            match occupant {
                Ok(state) => {
                    if let Err(e) = self.registry.replace_slot(&identity, Some(state)).await {
                        tracing::error!(equipment = %identity, error = %e, "failed to install slot");
                    }
                }
                Err(e) => {
                    tracing::error!(equipment = %identity, error = %e, "equipment not offered");
                }
            }
        }
    }

    /// Handle one teardown event.
    pub async fn handle_event(&self, event: SlotEvent) {
        let current = self
            .registry
            .state(&event.identity)
            .and_then(|state| state.local().map(|d| d.id()));
        if current != Some(event.driver_id) {
            tracing::debug!(equipment = %event.identity, reason = %event.reason, "stale slot event");
            return;
        }

        let morph = event.identity.kind.is_singleton()
            && matches!(event.reason, TeardownReason::NotDetected | TeardownReason::ProbeTimeout);

        let replacement = if morph {
            tracing::info!(
                equipment = %event.identity,
                reason = %event.reason,
                peer = %self.site.peer_hostname(),
                "morphing driver into forwarder"
            );
            self.forwarder(event.identity)
        } else {
            tracing::info!(equipment = %event.identity, reason = %event.reason, "resurrecting driver");
            tokio::time::sleep(self.config.driver.restart_delay).await;
            self.local_driver(event.identity).await
        };

        let new = match replacement {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(equipment = %event.identity, error = %e, "replacement failed, slot left empty");
                None
            }
        };
        if let Err(e) = self.registry.replace_slot(&event.identity, new).await {
            tracing::error!(equipment = %event.identity, error = %e, "failed to replace slot");
        }
    }

    /// Process events until `cancel` fires. Only the first call gets the receiver.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let receiver = self.receiver.lock().take();
        tokio::spawn(async move {
            let Some(mut receiver) = receiver else {
                tracing::warn!("slot manager already running");
                return;
            };
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Some(event) => manager.handle_event(event).await,
                    None => break,
                }
            }
            tracing::debug!("slot manager stopped");
        })
    }
}
