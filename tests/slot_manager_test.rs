//! Slot replacement: an absent mount becomes a forwarder, crashed drivers
//! come back as fresh drivers in the same slot.

mod common;

use common::{eventually, shell_config, simulator_config};
use last_unit::config::UnitConfig;
use last_unit::equipment::{Equipment, EquipmentIdentity, Site};
use last_unit::lipp::TeardownReason;
use last_unit::slots::{SlotManager, SlotRegistry};
use last_unit::EquipmentDriver;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn manager(site: &str, driver: last_unit::config::DriverConfig) -> Arc<SlotManager> {
    let config = UnitConfig {
        driver,
        ..Default::default()
    };
    SlotManager::new(
        Arc::new(SlotRegistry::for_rig()),
        Site::from_hostname(site).unwrap(),
        Arc::new(config),
    )
}

async fn install_local(manager: &SlotManager, identity: EquipmentIdentity) -> u64 {
    let state = manager.local_driver(identity).await.unwrap();
    let id = state.local().unwrap().id();
    manager.registry().replace_slot(&identity, Some(state)).await.unwrap();
    id
}

#[tokio::test]
async fn absent_mount_morphs_into_forwarder() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager("last07e", simulator_config(dir.path(), &["--not-detected"]));
    let mount = EquipmentIdentity::mount();

    // Events queue until the manager runs, so install before starting it.
    let driver_id = install_local(&manager, mount).await;
    let local = manager.registry().state(&mount).unwrap().local().cloned().unwrap();
    let cancel = CancellationToken::new();
    let task = manager.run(cancel.clone());

    assert!(
        eventually(Duration::from_secs(5), || async {
            manager
                .registry()
                .state(&mount)
                .is_some_and(|s| s.is_forwarder())
        })
        .await
    );
    let state = manager.registry().state(&mount).unwrap();
    let forwarder = state.forwarder().unwrap();
    assert_eq!(forwarder.peer(), "last07w");
    assert_eq!(forwarder.base_url(), "http://last07w:8000/last/api/v1/mount/0");
    assert_eq!(state.driver().identity(), mount);

    assert_eq!(local.id(), driver_id);
    assert!(local.is_torn_down());
    assert!(local.supervisor().pid().is_none());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn silent_detected_mount_morphs_into_forwarder() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = simulator_config(dir.path(), &["--probe-interval", "0s"]);
    driver.probe_timeout = Duration::from_secs(1);
    let manager = manager("last07w", driver);
    let mount = EquipmentIdentity::mount();

    install_local(&manager, mount).await;
    let local = manager.registry().state(&mount).unwrap().local().cloned().unwrap();
    let cancel = CancellationToken::new();
    let task = manager.run(cancel.clone());

    assert!(
        eventually(Duration::from_secs(5), || async {
            manager
                .registry()
                .state(&mount)
                .is_some_and(|s| s.is_forwarder())
        })
        .await
    );
    let state = manager.registry().state(&mount).unwrap();
    let forwarder = state.forwarder().unwrap();
    assert_eq!(forwarder.peer(), "last07e");
    assert_eq!(forwarder.base_url(), "http://last07e:8000/last/api/v1/mount/0");
    assert!(local.is_torn_down());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn probe_timeout_event_morphs_mount_but_resurrects_focuser() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager("last07e", shell_config(dir.path(), "sleep 30"));
    let mount = EquipmentIdentity::mount();
    let focuser = EquipmentIdentity::new(Equipment::Focuser, 2).unwrap();
    let mount_id = install_local(&manager, mount).await;
    let focuser_id = install_local(&manager, focuser).await;

    for (identity, driver_id) in [(mount, mount_id), (focuser, focuser_id)] {
        manager
            .handle_event(last_unit::lipp::SlotEvent {
                identity,
                driver_id,
                reason: TeardownReason::ProbeTimeout,
            })
            .await;
    }

    let state = manager.registry().state(&mount).unwrap();
    assert_eq!(state.forwarder().unwrap().peer(), "last07w");
    let state = manager.registry().state(&focuser).unwrap();
    assert_ne!(state.local().unwrap().id(), focuser_id);

    manager.registry().shutdown_all().await;
}

#[tokio::test]
async fn crashed_driver_is_resurrected() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = shell_config(dir.path(), "sleep 0.2; exit 1");
    driver.restart_delay = Duration::from_millis(50);
    let manager = manager("last07e", driver);
    let focuser = EquipmentIdentity::new(Equipment::Focuser, 1).unwrap();

    let first_id = install_local(&manager, focuser).await;
    let first = manager.registry().state(&focuser).unwrap().local().cloned().unwrap();
    let cancel = CancellationToken::new();
    let task = manager.run(cancel.clone());

    assert!(
        eventually(Duration::from_secs(5), || async {
            manager
                .registry()
                .state(&focuser)
                .and_then(|s| s.local().map(|d| d.id()))
                .is_some_and(|id| id != first_id)
        })
        .await
    );
    let state = manager.registry().state(&focuser).unwrap();
    let second = state.local().unwrap();
    assert_eq!(second.identity(), focuser);
    assert_eq!(second.supervisor().command(), first.supervisor().command());
    assert_eq!(second.current_request_id(), 0);
    assert!(first.is_torn_down());

    cancel.cancel();
    task.await.unwrap();
    manager.registry().shutdown_all().await;
}

#[tokio::test]
async fn stale_events_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager("last07w", shell_config(dir.path(), "sleep 30"));
    let camera = EquipmentIdentity::new(Equipment::Camera, 3).unwrap();
    let driver_id = install_local(&manager, camera).await;

    manager
        .handle_event(last_unit::lipp::SlotEvent {
            identity: camera,
            driver_id: driver_id + 1000,
            reason: TeardownReason::ProcessExited,
        })
        .await;
    let state = manager.registry().state(&camera).unwrap();
    assert_eq!(state.local().unwrap().id(), driver_id);
    assert!(!state.local().unwrap().is_torn_down());

    manager.registry().shutdown_all().await;
}

#[tokio::test]
async fn populate_splits_local_and_peer_sides() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager("last07w", shell_config(dir.path(), "sleep 30"));
    manager.populate().await;

    let registry = manager.registry();
    for id in 1..=4u8 {
        for kind in [Equipment::Camera, Equipment::Focuser] {
            let identity = EquipmentIdentity::new(kind, id).unwrap();
            let state = registry.state(&identity).unwrap();
            assert_eq!(state.is_forwarder(), id <= 2, "{identity}");
        }
    }
    let f1 = registry
        .state(&EquipmentIdentity::new(Equipment::Focuser, 1).unwrap())
        .unwrap();
    assert_eq!(
        f1.forwarder().unwrap().base_url(),
        "http://last07e:8000/last/api/v1/focuser/1"
    );
    assert!(registry.state(&EquipmentIdentity::mount()).unwrap().local().is_some());

    registry.shutdown_all().await;
    let mount = registry.state(&EquipmentIdentity::mount()).unwrap();
    assert!(mount.local().unwrap().is_torn_down());
}
