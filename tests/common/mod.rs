//! Shared helpers for driver integration tests.
#![allow(dead_code)]

use last_unit::config::{DriverConfig, MAX_MESSAGE_BYTES};
use last_unit::lipp::Namespace;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Socket prefix used by every test driver.
pub const PREFIX: &str = "it";

/// Driver configuration with filesystem sockets under `dir` and short timeouts.
pub fn driver_config(dir: &Path, program: &str, args: Vec<String>) -> DriverConfig {
    DriverConfig {
        program: program.to_string(),
        args,
        socket_prefix: PREFIX.to_string(),
        namespace: Namespace::Filesystem,
        socket_dir: dir.to_path_buf(),
        ready_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_secs(10),
        lock_timeout: Duration::from_secs(3),
        stop_grace: Duration::from_secs(1),
        restart_delay: Duration::from_millis(100),
        max_message_bytes: MAX_MESSAGE_BYTES,
    }
}

/// Driver configuration launching the simulator binary with `extra` arguments.
pub fn simulator_config(dir: &Path, extra: &[&str]) -> DriverConfig {
    let mut args: Vec<String> = [
        "--equipment",
        "{equipment}",
        "--id",
        "{id}",
        "--namespace",
        "filesystem",
        "--socket-prefix",
        PREFIX,
        "--socket-dir",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(dir.display().to_string());
    args.extend(extra.iter().map(|s| s.to_string()));
    driver_config(dir, env!("CARGO_BIN_EXE_lipp_simulator"), args)
}

/// Driver configuration running `sh -c script`.
pub fn shell_config(dir: &Path, script: &str) -> DriverConfig {
    driver_config(dir, "sh", vec!["-c".to_string(), script.to_string()])
}

/// Poll `condition` every 20 ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
