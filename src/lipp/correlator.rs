//! Request/Response Correlator.
//!
//! One request is in flight per driver at any time. Callers queue on an async
//! mutex with a bounded wait; the holder allocates the next request id, sends,
//! and reads until the matching response or the receive timeout. A response
//! carrying any other id is a protocol error for that exchange.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::protocol::{Detection, ReadyPacket, Request, Response};
use super::state::LivenessState;
use super::transport::TransportChannel;
use crate::error::{UnitError, UnitResult};

/// Exchange bookkeeping owned by whoever holds the lock.
#[derive(Debug, Default)]
struct Exchange {
    pending: Option<u64>,
}

/// Serializes calls to one driver process and matches responses to requests.
#[derive(Debug)]
pub struct Correlator {
    channel: Arc<TransportChannel>,
    state: Arc<LivenessState>,
    exchange: Mutex<Exchange>,
    current_request_id: AtomicU64,
    lock_timeout: Duration,
    equipment: String,
    cancel: CancellationToken,
}

impl Correlator {
    /// Correlator over `channel`, reporting into `state`.
    pub fn new(
        channel: Arc<TransportChannel>,
        state: Arc<LivenessState>,
        equipment: impl Into<String>,
        lock_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            state,
            exchange: Mutex::new(Exchange::default()),
            current_request_id: AtomicU64::new(0),
            lock_timeout,
            equipment: equipment.into(),
            cancel,
        }
    }

    /// Id of the last request issued in this incarnation (0 before the first).
    pub fn current_request_id(&self) -> u64 {
        self.current_request_id.load(Ordering::Acquire)
    }

    /// Restart numbering for a new process incarnation.
    pub async fn reset(&self) {
        let mut exchange = self.exchange.lock().await;
        exchange.pending = None;
        self.current_request_id.store(0, Ordering::Release);
        self.channel.rearm();
    }

    async fn receive(&self) -> UnitResult<Vec<u8>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UnitError::ShuttingDown),
            received = self.channel.receive() => received,
        }
    }

    /// Wait for the ready packet of a freshly started process.
    ///
    /// Holds the lock for the whole wait so no request can consume the packet.
    pub async fn await_ready(&self) -> UnitResult<Detection> {
        let _exchange = self.exchange.lock().await;
        tracing::info!(
            equipment = %self.equipment,
            timeout = ?self.channel.current_timeout(),
            "waiting for ready packet"
        );
        let bytes = match self.receive().await {
            Ok(bytes) => bytes,
            Err(e) => {
                if matches!(e, UnitError::Timeout { .. }) {
                    self.state.record_timeout();
                }
                return Err(e);
            }
        };
        self.state.record_response();
        let detection = ReadyPacket::parse(&bytes, &self.equipment)?;
        self.state.mark_ready(detection);
        Ok(detection)
    }

    /// Issue one request and wait for its response.
    pub async fn call(&self, method: &str, parameters: Map<String, Value>) -> UnitResult<Value> {
        if !self.state.detected() {
            return Err(UnitError::NotDetected {
                equipment: self.equipment.clone(),
            });
        }

        let mut exchange = tokio::time::timeout(self.lock_timeout, self.exchange.lock())
            .await
            .map_err(|_| {
                tracing::warn!(equipment = %self.equipment, method, "driver busy");
                UnitError::Busy {
                    equipment: self.equipment.clone(),
                    waited: self.lock_timeout,
                }
            })?;

        self.channel.drain_stale();
        let request_id = self.current_request_id.fetch_add(1, Ordering::AcqRel) + 1;
        let request = Request::new(request_id, method, parameters);
        let payload = serde_json::to_vec(&request)?;

        tracing::debug!(equipment = %self.equipment, request_id, method, "sending request");
        self.channel.send(&payload).await?;
        exchange.pending = Some(request_id);

        let received = self.receive().await;
        exchange.pending = None;
        let bytes = match received {
            Ok(bytes) => {
                self.state.record_response();
                bytes
            }
            Err(e) => {
                if matches!(e, UnitError::Timeout { .. }) {
                    tracing::warn!(equipment = %self.equipment, request_id, method, "no response");
                    self.state.record_timeout();
                }
                return Err(e);
            }
        };

        let response = Response::parse(&bytes, &self.equipment)?;
        match response.request_id {
            Some(id) if id >= 0 && id as u64 == request_id => {}
            Some(id) => {
                tracing::error!(
                    equipment = %self.equipment,
                    expected = request_id,
                    got = id,
                    method,
                    "response correlation mismatch"
                );
                return Err(UnitError::Protocol {
                    equipment: self.equipment.clone(),
                    message: format!("expected RequestId {} got {}", request_id, id),
                });
            }
            None => {
                tracing::error!(equipment = %self.equipment, expected = request_id, method, "response without RequestId");
                return Err(UnitError::Protocol {
                    equipment: self.equipment.clone(),
                    message: "missing RequestId in response".to_string(),
                });
            }
        }

        response.into_result(&self.equipment)
    }

    /// Send a request without waiting for a reply, e.g. `quit`.
    pub async fn notify(&self, method: &str) -> UnitResult<()> {
        let _exchange = tokio::time::timeout(self.lock_timeout, self.exchange.lock())
            .await
            .map_err(|_| UnitError::Busy {
                equipment: self.equipment.clone(),
                waited: self.lock_timeout,
            })?;
        let request_id = self.current_request_id.fetch_add(1, Ordering::AcqRel) + 1;
        let payload = serde_json::to_vec(&Request::new(request_id, method, Map::new()))?;
        self.channel.send(&payload).await
    }
}
