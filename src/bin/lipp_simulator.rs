//! Driver-side LIPP simulator.
//!
//! Stands in for a real driver process: binds the driver address of one
//! equipment instance, announces itself with a ready packet, answers every
//! request, pushes probe messages at a fixed cadence and exits on `quit`.
//!
//! ```bash
//! lipp_simulator --equipment focuser --id 2 --probe-interval 5s
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use last_unit::config::MAX_MESSAGE_BYTES;
use last_unit::equipment::{Equipment, EquipmentIdentity};
use last_unit::lipp::protocol::{Timing, TimingLeg};
use last_unit::lipp::transport::DatagramSocket;
use last_unit::lipp::{Namespace, RemoteException, Request, Response, SocketNaming};
use last_unit::logging::{self, OutputFormat, TracingConfig};

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_namespace(s: &str) -> Result<Namespace, String> {
    match s {
        "abstract" => Ok(Namespace::Abstract),
        "filesystem" => Ok(Namespace::Filesystem),
        other => Err(format!("unknown namespace '{}'", other)),
    }
}

#[derive(Parser, Debug)]
#[command(name = "lipp_simulator")]
#[command(about = "Simulated LIPP driver process", long_about = None)]
struct Args {
    /// Equipment kind (mount, camera, focuser)
    #[arg(long)]
    equipment: Equipment,

    /// Equipment id (0 for the mount)
    #[arg(long, default_value_t = 0)]
    id: u8,

    /// Announce the hardware as not detected
    #[arg(long)]
    not_detected: bool,

    /// Probe cadence; 0s disables probes
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    probe_interval: Duration,

    /// Answer every request with this JSON value instead of a description of the call
    #[arg(long)]
    value: Option<String>,

    /// Answer this method with an error (repeatable)
    #[arg(long = "fail")]
    fail: Vec<String>,

    /// Never answer this method (repeatable)
    #[arg(long = "ignore")]
    ignore: Vec<String>,

    /// Socket name prefix
    #[arg(long, default_value = "lipp")]
    socket_prefix: String,

    /// Socket namespace (abstract, filesystem)
    #[arg(long, default_value = "abstract", value_parser = parse_namespace)]
    namespace: Namespace,

    /// Directory of filesystem sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

/// Value of a successful reply.
fn reply_value(request: &Request, fixed: Option<&Value>) -> Value {
    if let Some(value) = fixed {
        return value.clone();
    }
    let params: Vec<String> = request
        .parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    Value::String(format!(
        "dummy response to {}({})",
        request.method,
        params.join(", ")
    ))
}

fn respond(request: &Request, fixed: Option<&Value>, fail: &[String]) -> Response {
    let received = Utc::now();
    let mut response = Response {
        request_id: i64::try_from(request.request_id).ok(),
        ..Default::default()
    };
    if fail.iter().any(|m| m == &request.method) {
        response.error = Some(format!("simulated failure of {}", request.method));
        response.exception = Some(RemoteException {
            identifier: "Simulator:failure".into(),
            message: format!("{} failed on request", request.method),
            cause: None,
            correction: None,
            stack: vec![],
        });
    } else {
        response.value = reply_value(request, fixed);
    }
    response.timing = Some(Timing {
        request: TimingLeg {
            sent: Some(json!(request.request_time)),
            received: Some(json!(received)),
        },
        response: TimingLeg {
            sent: Some(json!(Utc::now())),
            received: None,
        },
    });
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log = logging::init(TracingConfig::new(tracing::Level::INFO).with_format(OutputFormat::Compact))
        .map_err(|e| anyhow::anyhow!(e))?;

    let identity = EquipmentIdentity::new(args.equipment, args.id)?;
    let fixed = args
        .value
        .as_deref()
        .map(|raw| serde_json::from_str::<Value>(raw))
        .transpose()
        .context("--value must be JSON")?;

    let dir = args.socket_dir.clone().unwrap_or_else(std::env::temp_dir);
    let naming = SocketNaming::new(args.socket_prefix.clone(), args.namespace, dir);
    let local = naming.driver(&identity);
    let unit = naming.unit(&identity);
    let probe = naming.probe(&identity);

    let socket = DatagramSocket::bind(&local, MAX_MESSAGE_BYTES)
        .await
        .with_context(|| format!("cannot bind {}", local))?;
    tracing::info!(equipment = %identity, address = %local, "simulator up");

    let ready = if args.not_detected { "not-detected" } else { "detected" };
    socket
        .send_to(json!({ "Value": ready }).to_string().as_bytes(), &unit)
        .await
        .context("cannot send ready packet")?;

    // Zero disables probes; park the ticker far in the future instead.
    let period = if args.probe_interval.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        args.probe_interval
    };
    let mut probes = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = probes.tick(), if !args.probe_interval.is_zero() => {
                let message = json!({ "AnswersToProbe": !args.not_detected }).to_string();
                if let Err(e) = socket.send_to(message.as_bytes(), &probe).await {
                    tracing::debug!(error = %e, "probe not delivered");
                }
            }
            received = socket.recv() => {
                let bytes = match received {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        continue;
                    }
                };
                let request: Request = match serde_json::from_slice(&bytes) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed request");
                        continue;
                    }
                };
                if request.method == "quit" {
                    tracing::info!("exiting on quit request");
                    break;
                }
                if args.ignore.contains(&request.method) {
                    tracing::info!(request_id = request.request_id, method = %request.method, "ignoring request");
                    continue;
                }
                let response = respond(&request, fixed.as_ref(), &args.fail);
                let payload = serde_json::to_vec(&response)?;
                if let Err(e) = socket.send_to(&payload, &unit).await {
                    tracing::warn!(request_id = request.request_id, error = %e, "reply not delivered");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn dummy_value_lists_parameters() {
        let mut params = Map::new();
        params.insert("a1".into(), json!(10.5));
        let request = Request::new(3, "goTo", params);
        assert_eq!(reply_value(&request, None), json!("dummy response to goTo(a1=10.5)"));
        assert_eq!(reply_value(&request, Some(&json!(1234.5))), json!(1234.5));
    }

    #[test]
    fn failing_method_carries_exception() {
        let request = Request::new(1, "home", Map::new());
        let response = respond(&request, None, &["home".to_string()]);
        assert_eq!(response.request_id, Some(1));
        assert!(response.error.is_some());
        assert_eq!(response.exception.unwrap().identifier, "Simulator:failure");
    }
}
