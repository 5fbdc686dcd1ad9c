//! HTTP forwarder to the peer unit.
//!
//! Equipment that lives on the other half of the rig is reached through the
//! peer's own HTTP API: `GET`/`PUT <base>/<method>?<params>` with
//! `<base> = http://<peer>:<port><api_root>/<equipment>/<id>`.
//! Proxies from the environment are ignored and redirects are not followed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};

use crate::config::ForwarderConfig;
use crate::driver_interface::{EquipmentDriver, Params};
use crate::equipment::EquipmentIdentity;
use crate::error::{UnitError, UnitResult};
use crate::lipp::TriState;

#[derive(Debug, Default)]
struct ForwarderState {
    detected: bool,
    responding: TriState,
    last_response: Option<DateTime<Utc>>,
}

/// [`EquipmentDriver`] backed by the peer unit's HTTP API.
#[derive(Debug)]
pub struct Forwarder {
    identity: EquipmentIdentity,
    label: String,
    peer: String,
    base_url: String,
    client: Client,
    state: RwLock<ForwarderState>,
}

/// Render a parameter value the way it appears in a query string.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Forwarder {
    /// Forwarder for `identity` on host `peer`.
    pub fn new(
        identity: EquipmentIdentity,
        peer: impl Into<String>,
        config: &ForwarderConfig,
        api_root: &str,
    ) -> UnitResult<Self> {
        let peer = peer.into();
        let label = identity.label();
        let client = Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UnitError::Forwarder {
                equipment: label.clone(),
                message: e.to_string(),
            })?;
        let base_url = format!(
            "http://{}:{}{}/{}/{}",
            peer,
            config.port,
            api_root.trim_end_matches('/'),
            identity.kind.name(),
            identity.id
        );
        tracing::info!(equipment = %label, url = %base_url, "forwarding to peer");
        Ok(Self {
            identity,
            label,
            peer,
            base_url,
            client,
            state: RwLock::new(ForwarderState::default()),
        })
    }

    /// Host the forwarder talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Base URL of the forwarded equipment.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, method: &str, params: &Params) -> UnitResult<Url> {
        let url = format!("{}/{}", self.base_url, method);
        let pairs = params.iter().map(|(k, v)| (k.as_str(), query_value(v)));
        Url::parse_with_params(&url, pairs).map_err(|e| UnitError::Forwarder {
            equipment: self.label.clone(),
            message: format!("bad url '{}': {}", url, e),
        })
    }

    fn mark_failed(&self) {
        let mut state = self.state.write();
        state.detected = false;
        state.responding = TriState::False;
    }

    fn mark_ok(&self) {
        let mut state = self.state.write();
        state.detected = true;
        state.responding = TriState::True;
        state.last_response = Some(Utc::now());
    }

    async fn forward(&self, method: Method, name: &str, params: Params) -> UnitResult<Value> {
        let url = self.url(name, &params)?;
        tracing::info!(equipment = %self.label, %method, %url, "forwarding");

        let response = match self.client.request(method, url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.mark_failed();
                tracing::error!(equipment = %self.label, error = %e, "HTTP error");
                return Err(UnitError::Forwarder {
                    equipment: self.label.clone(),
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.mark_failed();
                return Err(UnitError::Forwarder {
                    equipment: self.label.clone(),
                    message: format!("HTTP {}: unreadable body: {}", status, e),
                });
            }
        };

        let error = body.get("Error").filter(|e| !e.is_null());
        if status.is_success() && error.is_none() {
            self.mark_ok();
            return Ok(body.get("Value").cloned().unwrap_or(Value::Null));
        }

        self.mark_failed();
        tracing::warn!(equipment = %self.label, %status, error = ?error, "peer reported failure");
        match (body.get("ErrorKind").and_then(Value::as_str), error) {
            (Some("not_detected"), _) => Err(UnitError::NotDetected {
                equipment: self.label.clone(),
            }),
            (Some("shutting_down"), _) => Err(UnitError::ShuttingDown),
            (_, Some(error)) => Err(UnitError::Remote {
                equipment: self.label.clone(),
                error: query_value(error),
                exception: body
                    .get("Exception")
                    .and_then(|ex| serde_json::from_value(ex.clone()).ok())
                    .map(Box::new),
            }),
            (_, None) => Err(UnitError::Forwarder {
                equipment: self.label.clone(),
                message: format!("HTTP {}", status),
            }),
        }
    }
}

#[async_trait]
impl EquipmentDriver for Forwarder {
    fn identity(&self) -> EquipmentIdentity {
        self.identity
    }

    async fn get(&self, method: &str, params: Params) -> UnitResult<Value> {
        self.forward(Method::GET, method, params).await
    }

    async fn put(&self, method: &str, params: Params) -> UnitResult<Value> {
        self.forward(Method::PUT, method, params).await
    }

    fn detected(&self) -> bool {
        self.state.read().detected
    }

    fn responding(&self) -> bool {
        self.state.read().responding.is_true()
    }

    fn last_response(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_response
    }

    fn info(&self) -> Value {
        json!({
            "Type": "HTTP Forwarder",
            "Equipment": self.label,
            "Url": self.base_url,
        })
    }

    fn status(&self) -> Value {
        let state = self.state.read();
        json!({
            "Detected": state.detected,
            "Responding": state.responding.to_json(),
            "LastResponse": state.last_response,
        })
    }
}
