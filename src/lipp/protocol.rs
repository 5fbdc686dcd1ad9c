//! LIPP wire format.
//!
//! Every datagram is a UTF-8 JSON object. The unit sends [`Request`]s; the
//! driver process answers with one [`ReadyPacket`] right after start-up and
//! then one [`Response`] per request. Probe datagrams ([`ProbeMessage`])
//! travel on a separate socket.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{UnitError, UnitResult};

// =============================================================================
// Outbound
// =============================================================================

/// Request sent from the unit to a driver process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    /// Strictly increasing per process incarnation, starting at 1
    pub request_id: u64,
    /// Method name, e.g. `Pos` or `goTo`
    pub method: String,
    /// Named parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// When the unit issued the request
    pub request_time: DateTime<Utc>,
}

impl Request {
    /// Build a request stamped with the current time.
    pub fn new(request_id: u64, method: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            request_id,
            method: method.into(),
            parameters,
            request_time: Utc::now(),
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Hardware detection outcome declared by the ready packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Detection {
    /// The driver found its hardware
    Detected,
    /// The driver could not find its hardware
    NotDetected,
}

/// First datagram read from a freshly started driver process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadyPacket {
    /// `detected` / `not-detected`, or the older `ready` / `unavailable`
    pub value: Value,
}

impl ReadyPacket {
    /// Parse a ready datagram into its detection outcome.
    pub fn parse(bytes: &[u8], equipment: &str) -> UnitResult<Detection> {
        let packet: ReadyPacket =
            serde_json::from_slice(bytes).map_err(|e| UnitError::Protocol {
                equipment: equipment.to_string(),
                message: format!("malformed ready packet: {}", e),
            })?;
        // Older drivers wrap the word in {"Status": ...}
        let word = match &packet.value {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => o.get("Status").and_then(Value::as_str),
            _ => None,
        };
        match word {
            Some("detected") | Some("ready") => Ok(Detection::Detected),
            Some("not-detected") | Some("unavailable") => Ok(Detection::NotDetected),
            _ => Err(UnitError::Protocol {
                equipment: equipment.to_string(),
                message: format!("unexpected ready packet value {}", packet.value),
            }),
        }
    }
}

/// One frame of a remote stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Source file
    #[serde(default)]
    pub file: String,
    /// Line number
    #[serde(default)]
    pub line: i64,
    /// Function name
    #[serde(default)]
    pub name: String,
}

/// Exception detail reported by the driver process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteException {
    /// Error identifier, e.g. `MATLAB:undefinedFunction`
    #[serde(default)]
    pub identifier: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Nested cause(s), free form
    #[serde(default)]
    pub cause: Option<Value>,
    /// Suggested correction, free form
    #[serde(default, rename = "Correction")]
    pub correction: Option<Value>,
    /// Stack frames, innermost first
    #[serde(default)]
    pub stack: Vec<StackFrame>,
}

impl RemoteException {
    /// Log the whole exception at error level.
    pub fn log(&self, equipment: &str) {
        tracing::error!(
            equipment,
            identifier = %self.identifier,
            message = %self.message,
            cause = ?self.cause,
            correction = ?self.correction,
            "remote exception"
        );
        for (i, frame) in self.stack.iter().enumerate() {
            tracing::error!(
                equipment,
                frame = i,
                file = %frame.file,
                line = frame.line,
                name = %frame.name,
                "remote stack"
            );
        }
    }
}

/// One direction of a request/response exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimingLeg {
    /// When the datagram was sent
    #[serde(default)]
    pub sent: Option<Value>,
    /// When the datagram was received
    #[serde(default)]
    pub received: Option<Value>,
}

/// Diagnostic timing block attached to a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Timing {
    /// Unit -> driver leg
    #[serde(default)]
    pub request: TimingLeg,
    /// Driver -> unit leg
    #[serde(default)]
    pub response: TimingLeg,
}

/// Durations derived from a [`Timing`] block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSummary {
    /// Request sent to response received
    pub elapsed: chrono::Duration,
    /// Request leg
    pub request: chrono::Duration,
    /// Response leg
    pub response: chrono::Duration,
}

fn parse_timestamp(value: &Option<Value>) -> Option<DateTime<Utc>> {
    let s = value.as_ref()?.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl Timing {
    /// Summarize, using `received` when the response leg lacks a receive stamp.
    pub fn summarize(&self, received: DateTime<Utc>) -> Option<TimingSummary> {
        let req_sent = parse_timestamp(&self.request.sent)?;
        let req_received = parse_timestamp(&self.request.received)?;
        let resp_sent = parse_timestamp(&self.response.sent)?;
        let resp_received = parse_timestamp(&self.response.received).unwrap_or(received);
        Some(TimingSummary {
            elapsed: resp_received - req_sent,
            request: req_received - req_sent,
            response: resp_received - resp_sent,
        })
    }
}

/// Response from a driver process to one [`Request`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    /// Must equal the pending request's id
    #[serde(default)]
    pub request_id: Option<i64>,
    /// Method result
    #[serde(default)]
    pub value: Value,
    /// Error message, mutually exclusive with a meaningful `value`
    #[serde(default)]
    pub error: Option<String>,
    /// Structured exception detail
    #[serde(default)]
    pub exception: Option<RemoteException>,
    /// Diagnostic timing
    #[serde(default)]
    pub timing: Option<Timing>,
}

impl Response {
    /// Decode a response datagram.
    pub fn parse(bytes: &[u8], equipment: &str) -> UnitResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| UnitError::Protocol {
            equipment: equipment.to_string(),
            message: format!("malformed response: {}", e),
        })
    }

    /// Turn the response into the method result, logging remote failures.
    pub fn into_result(self, equipment: &str) -> UnitResult<Value> {
        if let Some(timing) = &self.timing {
            if let Some(summary) = timing.summarize(Utc::now()) {
                tracing::debug!(
                    equipment,
                    request_id = ?self.request_id,
                    elapsed_us = summary.elapsed.num_microseconds(),
                    request_us = summary.request.num_microseconds(),
                    response_us = summary.response.num_microseconds(),
                    "timing"
                );
            }
        }

        if self.error.is_none() && self.exception.is_none() {
            return Ok(self.value);
        }

        if let Some(error) = &self.error {
            tracing::error!(equipment, request_id = ?self.request_id, error = %error, "remote error");
        }
        if let Some(exception) = &self.exception {
            exception.log(equipment);
        }
        let error = self
            .error
            .clone()
            .or_else(|| self.exception.as_ref().map(|e| e.message.clone()))
            .unwrap_or_default();
        Err(UnitError::Remote {
            equipment: equipment.to_string(),
            error,
            exception: self.exception.map(Box::new),
        })
    }
}

/// Unsolicited liveness signal on the probe socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {
    /// Whether the hardware answered the driver's own probe; absent means unknown
    #[serde(rename = "AnswersToProbe", default)]
    pub answers_to_probe: Option<bool>,
}

impl ProbeMessage {
    /// Decode a probe datagram.
    pub fn parse(bytes: &[u8], equipment: &str) -> UnitResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| UnitError::Protocol {
            equipment: equipment.to_string(),
            message: format!("malformed probe message: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_pascal_case_keys() {
        let mut params = Map::new();
        params.insert("position".into(), json!(10234));
        let req = Request::new(7, "move", params);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["RequestId"], 7);
        assert_eq!(v["Method"], "move");
        assert_eq!(v["Parameters"]["position"], 10234);
        assert!(v["RequestTime"].is_string());
    }

    #[test]
    fn ready_packet_values() {
        let d = ReadyPacket::parse(br#"{"Value":"detected"}"#, "focuser-2").unwrap();
        assert_eq!(d, Detection::Detected);
        let d = ReadyPacket::parse(br#"{"Value":"not-detected"}"#, "mount").unwrap();
        assert_eq!(d, Detection::NotDetected);
        let d = ReadyPacket::parse(br#"{"Value":"unavailable"}"#, "mount").unwrap();
        assert_eq!(d, Detection::NotDetected);
        let d = ReadyPacket::parse(br#"{"Value":{"Status":"ready"}}"#, "mount").unwrap();
        assert_eq!(d, Detection::Detected);
        assert!(ReadyPacket::parse(br#"{"Value":42}"#, "mount").is_err());
        assert!(ReadyPacket::parse(b"not json", "mount").is_err());
    }

    #[test]
    fn plain_response_yields_value() {
        let r = Response::parse(br#"{"RequestId":1,"Value":1234.5,"Error":null}"#, "focuser-2")
            .unwrap();
        assert_eq!(r.request_id, Some(1));
        assert_eq!(r.into_result("focuser-2").unwrap(), json!(1234.5));
    }

    #[test]
    fn exception_becomes_remote_error() {
        let bytes = br#"{
            "RequestId": 3,
            "Value": null,
            "Error": null,
            "Exception": {
                "identifier": "MATLAB:badsubscript",
                "message": "Index exceeds array bounds",
                "cause": [],
                "Correction": null,
                "stack": [{"file": "Lipp.m", "line": 120, "name": "Lipp.loop"}]
            }
        }"#;
        let r = Response::parse(bytes, "camera-1").unwrap();
        match r.into_result("camera-1") {
            Err(UnitError::Remote { error, exception, .. }) => {
                assert_eq!(error, "Index exceeds array bounds");
                let ex = exception.unwrap();
                assert_eq!(ex.stack.len(), 1);
                assert_eq!(ex.stack[0].line, 120);
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn error_string_becomes_remote_error() {
        let r = Response::parse(br#"{"RequestId":2,"Value":null,"Error":"no such method"}"#, "x")
            .unwrap();
        let err = r.into_result("x").unwrap_err();
        assert!(err.to_string().contains("no such method"));
    }

    #[test]
    fn timing_summary() {
        let timing: Timing = serde_json::from_value(json!({
            "Request": {"Sent": "2024-05-01T10:00:00Z", "Received": "2024-05-01T10:00:00.002Z"},
            "Response": {"Sent": "2024-05-01T10:00:00.010Z"}
        }))
        .unwrap();
        let received = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.011Z")
            .unwrap()
            .with_timezone(&Utc);
        let s = timing.summarize(received).unwrap();
        assert_eq!(s.request.num_milliseconds(), 2);
        assert_eq!(s.response.num_milliseconds(), 1);
        assert_eq!(s.elapsed.num_milliseconds(), 11);
    }

    #[test]
    fn probe_message() {
        let p = ProbeMessage::parse(br#"{"AnswersToProbe":true}"#, "mount").unwrap();
        assert_eq!(p.answers_to_probe, Some(true));
        let p = ProbeMessage::parse(br#"{}"#, "mount").unwrap();
        assert_eq!(p.answers_to_probe, None);
    }
}
