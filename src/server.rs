//! HTTP surface.
//!
//! Routes, relative to `api_root` (default `/last/api/v1`):
//!
//! | method  | path                              | action |
//! |---------|-----------------------------------|--------|
//! | GET/PUT | `/{equipment}/{id}/{method}?…`    | `get`/`put` on the slot |
//! | GET/PUT | `/mount/{method}?…`               | same, for the mount (id 0) |
//! | GET     | `/{equipment}/{id}`               | info and health of the slot occupant |
//! | GET     | `/unit/status`                    | aggregate status |
//! | GET/PUT | `/unit/abort`                     | abort everything |
//! | GET/PUT | `/unit/quit`                      | quit every local driver |
//! | GET/PUT | `/unit/slew_to_coordinates?a1&a2&coordtype` | slew the mount |
//!
//! plus `GET /shutdown` at the server root. Successful calls answer
//! `{"Value": …}`; failures answer the structured error body.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::driver_interface::Params;
use crate::equipment::{Equipment, EquipmentIdentity};
use crate::error::{ErrorKind, UnitError, UnitResult};
use crate::unit::Unit;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The unit behind every route
    pub unit: Arc<Unit>,
    /// Fired by `/shutdown`
    pub shutdown: CancellationToken,
}

impl IntoResponse for UnitError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotDetected | ErrorKind::PeerUnavailable | ErrorKind::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Busy | ErrorKind::Refused => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Protocol | ErrorKind::Remote | ErrorKind::Forwarder => StatusCode::BAD_GATEWAY,
            ErrorKind::InvalidEquipment => StatusCode::NOT_FOUND,
            ErrorKind::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Spawn | ErrorKind::Configuration | ErrorKind::Io | ErrorKind::Json => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.to_body())).into_response()
    }
}

fn value(v: Value) -> Json<Value> {
    Json(json!({ "Value": v }))
}

/// Interpret a query value: booleans and numbers become JSON scalars, anything else a string.
pub fn parse_param(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    Value::String(raw.to_string())
}

fn params(query: HashMap<String, String>) -> Params {
    query
        .into_iter()
        .map(|(k, v)| {
            let parsed = parse_param(&v);
            (k, parsed)
        })
        .collect()
}

fn identity(equipment: &str, id: &str) -> UnitResult<EquipmentIdentity> {
    let kind: Equipment = equipment.parse()?;
    let id: u8 = id
        .parse()
        .map_err(|_| UnitError::InvalidEquipment(format!("bad id '{}'", id)))?;
    EquipmentIdentity::new(kind, id)
}

// =============================================================================
// Equipment routes
// =============================================================================

async fn equipment_get(
    State(state): State<AppState>,
    Path((equipment, id, method)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> UnitResult<Json<Value>> {
    let identity = identity(&equipment, &id)?;
    let driver = state.unit.registry().get(&identity)?;
    driver.get(&method, params(query)).await.map(value)
}

async fn equipment_put(
    State(state): State<AppState>,
    Path((equipment, id, method)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> UnitResult<Json<Value>> {
    let identity = identity(&equipment, &id)?;
    let driver = state.unit.registry().get(&identity)?;
    driver.put(&method, params(query)).await.map(value)
}

async fn mount_get(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> UnitResult<Json<Value>> {
    let driver = state.unit.registry().get(&EquipmentIdentity::mount())?;
    driver.get(&method, params(query)).await.map(value)
}

async fn mount_put(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> UnitResult<Json<Value>> {
    let driver = state.unit.registry().get(&EquipmentIdentity::mount())?;
    driver.put(&method, params(query)).await.map(value)
}

async fn equipment_describe(
    State(state): State<AppState>,
    Path((equipment, id)): Path<(String, String)>,
) -> UnitResult<Json<Value>> {
    let identity = identity(&equipment, &id)?;
    let driver = state.unit.registry().get(&identity)?;
    Ok(value(driver.describe()))
}

// =============================================================================
// Unit routes
// =============================================================================

async fn unit_status(State(state): State<AppState>) -> Json<Value> {
    value(state.unit.status().await)
}

async fn unit_abort(State(state): State<AppState>) -> Json<Value> {
    value(state.unit.abort().await)
}

async fn unit_quit(State(state): State<AppState>) -> Json<Value> {
    state.unit.quit().await;
    value(json!("ok"))
}

async fn unit_slew(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> UnitResult<Json<Value>> {
    let coordinate = |name: &str| -> UnitResult<f64> {
        query
            .get(name)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| UnitError::Refused {
                equipment: "unit".into(),
                message: format!("missing or non-numeric '{}'", name),
            })
    };
    let a1 = coordinate("a1")?;
    let a2 = coordinate("a2")?;
    let coord_type = query.get("coordtype").map_or("eq", String::as_str);
    state
        .unit
        .slew_to_coordinates(a1, a2, coord_type)
        .await
        .map(value)
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    tracing::info!("shutdown requested");
    state.unit.quit().await;
    state.shutdown.cancel();
    value(json!("ok"))
}

/// Build the router.
pub fn router(state: AppState, api_root: &str) -> Router {
    let api = Router::new()
        .route("/unit/status", get(unit_status))
        .route("/unit/abort", get(unit_abort).put(unit_abort))
        .route("/unit/quit", get(unit_quit).put(unit_quit))
        .route("/unit/slew_to_coordinates", get(unit_slew).put(unit_slew))
        .route("/mount/{method}", get(mount_get).put(mount_put))
        .route("/{equipment}/{id}", get(equipment_describe))
        .route("/{equipment}/{id}/{method}", get(equipment_get).put(equipment_put));

    let api_root = api_root.trim_end_matches('/');
    let router = if api_root.is_empty() {
        api
    } else {
        Router::new().nest(api_root, api)
    };
    router
        .route("/shutdown", get(shutdown))
        .with_state(state)
}

/// Serve until `state.shutdown` fires.
pub async fn serve(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, api_root = %config.api_root, "unit listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state, &config.api_root))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnitSettings;
    use crate::slots::SlotRegistry;

    #[test]
    fn query_values_are_typed() {
        assert_eq!(parse_param("12"), json!(12));
        assert_eq!(parse_param("1.5"), json!(1.5));
        assert_eq!(parse_param("true"), json!(true));
        assert_eq!(parse_param("eq"), json!("eq"));
        assert_eq!(parse_param("nan"), json!("nan"));
    }

    #[test]
    fn identity_parsing() {
        assert_eq!(identity("focuser", "2").unwrap().label(), "focuser-2");
        assert!(identity("focuser", "x").is_err());
        assert!(identity("telescope", "1").is_err());
    }

    async fn spawn_server() -> (String, AppState) {
        let unit = Unit::new(Arc::new(SlotRegistry::for_rig()), UnitSettings::default());
        let state = AppState {
            unit,
            shutdown: CancellationToken::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = router(state.clone(), "/last/api/v1");
        let token = state.shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
        (base, state)
    }

    #[tokio::test]
    async fn empty_slot_returns_structured_error() {
        let (base, _state) = spawn_server().await;
        let response = reqwest::get(format!("{}/last/api/v1/focuser/2/Pos", base))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert!(body["Value"].is_null());
        assert_eq!(body["ErrorKind"], "not_detected");
        assert!(body["Error"].as_str().unwrap().contains("not-detected"));
    }

    #[tokio::test]
    async fn unknown_equipment_is_not_found() {
        let (base, _state) = spawn_server().await;
        let response = reqwest::get(format!("{}/last/api/v1/camera/7/status", base))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unit_status_route() {
        let (base, _state) = spawn_server().await;
        let body: Value = reqwest::get(format!("{}/last/api/v1/unit/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Value"]["Telescopes"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn shutdown_route_fires_token() {
        let (base, state) = spawn_server().await;
        let response = reqwest::get(format!("{}/shutdown", base)).await.unwrap();
        assert!(response.status().is_success());
        assert!(state.shutdown.is_cancelled());
    }
}
