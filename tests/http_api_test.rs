//! HTTP surface end to end: a simulated focuser served by one unit and
//! reached directly and through a second unit's forwarder.

mod common;

use common::{eventually, simulator_config};
use last_unit::config::{ForwarderConfig, UnitSettings};
use last_unit::equipment::{Equipment, EquipmentIdentity};
use last_unit::forwarder::Forwarder;
use last_unit::lipp::LippDriver;
use last_unit::server::{router, AppState};
use last_unit::slots::{SlotRegistry, SlotState};
use last_unit::unit::Unit;
use last_unit::EquipmentDriver;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const API_ROOT: &str = "/last/api/v1";

async fn serve(registry: Arc<SlotRegistry>) -> (u16, AppState) {
    let state = AppState {
        unit: Unit::new(registry, UnitSettings::default()),
        shutdown: CancellationToken::new(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = router(state.clone(), API_ROOT);
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    });
    (port, state)
}

async fn get_json(url: String) -> (reqwest::StatusCode, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn local_and_forwarded_focuser() {
    let dir = tempfile::tempdir().unwrap();
    let focuser = EquipmentIdentity::new(Equipment::Focuser, 2).unwrap();

    // Unit A drives the focuser.
    let config = simulator_config(dir.path(), &["--value", "1234.5"]);
    let driver = LippDriver::spawn(focuser, &config, None).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || async { driver.detected() }).await);
    let registry_a = Arc::new(SlotRegistry::for_rig());
    registry_a
        .replace_slot(&focuser, Some(SlotState::LocalDriver(driver.clone())))
        .await
        .unwrap();
    let (port_a, state_a) = serve(registry_a).await;

    let (status, body) = get_json(format!("http://127.0.0.1:{port_a}{API_ROOT}/focuser/2/Pos")).await;
    assert!(status.is_success());
    assert_eq!(body, json!({ "Value": 1234.5 }));

    let (_, body) = get_json(format!("http://127.0.0.1:{port_a}{API_ROOT}/focuser/2")).await;
    assert_eq!(body["Value"]["Info"]["Type"], "LIPP Driver");
    assert_eq!(body["Value"]["Health"]["Detected"], true);

    // Unit B reaches it through a forwarder.
    let forwarder_config = ForwarderConfig {
        port: port_a,
        timeout: Duration::from_secs(5),
    };
    let forwarder = Forwarder::new(focuser, "127.0.0.1", &forwarder_config, API_ROOT).unwrap();
    let registry_b = Arc::new(SlotRegistry::for_rig());
    registry_b
        .replace_slot(&focuser, Some(SlotState::RemoteForwarder(Arc::new(forwarder))))
        .await
        .unwrap();
    let (port_b, state_b) = serve(registry_b).await;

    let client = reqwest::Client::new();
    let response = client
        .put(format!("http://127.0.0.1:{port_b}{API_ROOT}/focuser/2/move?Pos=10"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.json::<Value>().await.unwrap()["Value"], json!(1234.5));

    let (_, body) = get_json(format!("http://127.0.0.1:{port_b}{API_ROOT}/unit/status")).await;
    let entry = &body["Value"]["Devices"]["Focusers"][1];
    assert_eq!(entry["Info"]["Type"], "HTTP Forwarder");
    assert_eq!(entry["Status"], json!(1234.5));

    // Three calls reached the driver process: Pos, move and the forwarded status.
    assert_eq!(driver.current_request_id(), 3);

    let (status, _) = get_json(format!("http://127.0.0.1:{port_b}/shutdown")).await;
    assert!(status.is_success());
    assert!(state_b.shutdown.is_cancelled());

    let (status, _) = get_json(format!("http://127.0.0.1:{port_a}/shutdown")).await;
    assert!(status.is_success());
    assert!(state_a.shutdown.is_cancelled());
    assert!(driver.is_torn_down());
}

#[tokio::test]
async fn slew_without_mount_is_unavailable() {
    let (port, _state) = serve(Arc::new(SlotRegistry::for_rig())).await;
    let client = reqwest::Client::new();
    let response = client
        .put(format!(
            "http://127.0.0.1:{port}{API_ROOT}/unit/slew_to_coordinates?a1=10&a2=20"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ErrorKind"], "not_detected");

    let response = client
        .put(format!("http://127.0.0.1:{port}{API_ROOT}/unit/slew_to_coordinates?a1=x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}
