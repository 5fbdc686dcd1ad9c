//! Process Supervisor: owns the external driver process of one equipment slot.
//!
//! The process runs in its own process group so that a forceful stop can
//! reach any children it spawned. Only handles started here are ever
//! signalled.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::address::LippAddress;
use crate::config::DriverConfig;
use crate::equipment::EquipmentIdentity;
use crate::error::{UnitError, UnitResult};

// =============================================================================
// Command line
// =============================================================================

/// Program and argument template with `{equipment}`, `{id}` and `{socket}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    /// Template with explicit parts.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Template from the driver configuration.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    /// Substitute the placeholders for one equipment instance.
    pub fn render(&self, identity: &EquipmentIdentity, driver_socket: &LippAddress) -> DriverCommand {
        let substitute = |s: &str| {
            s.replace("{equipment}", identity.kind.name())
                .replace("{id}", &identity.id.to_string())
                .replace("{socket}", driver_socket.name())
        };
        DriverCommand {
            program: substitute(&self.program),
            args: self.args.iter().map(|a| substitute(a)).collect(),
            env: vec![
                ("LIPP_EQUIPMENT".to_string(), identity.kind.name().to_string()),
                ("LIPP_EQUIPMENT_ID".to_string(), identity.id.to_string()),
                ("LIPP_SOCKET".to_string(), driver_socket.name().to_string()),
            ],
        }
    }
}

/// Fully resolved driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCommand {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
}

impl fmt::Display for DriverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// How a driver process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit requested by `stop`
    Planned(Option<ExitStatus>),
    /// The process ended on its own
    Unexpected(Option<ExitStatus>),
}

/// Spawns, watches and stops the driver process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    equipment: String,
    command: DriverCommand,
    stop_grace: Duration,
    pid: Mutex<Option<u32>>,
    exited: watch::Sender<bool>,
    terminating: AtomicBool,
    starts: AtomicU32,
}

impl ProcessSupervisor {
    /// Supervisor for `command`; nothing is started yet.
    pub fn new(equipment: impl Into<String>, command: DriverCommand, stop_grace: Duration) -> Self {
        let (exited, _) = watch::channel(true);
        Self {
            equipment: equipment.into(),
            command,
            stop_grace,
            pid: Mutex::new(None),
            exited,
            terminating: AtomicBool::new(false),
            starts: AtomicU32::new(0),
        }
    }

    /// The invocation used for every start.
    pub fn command(&self) -> &DriverCommand {
        &self.command
    }

    /// Pid of the running process, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Number of successful starts.
    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::Acquire)
    }

    /// Whether a planned stop is in progress or done.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Classify the next exit as planned, e.g. before asking the process to quit.
    pub fn expect_exit(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    /// Launch the process in its own process group.
    ///
    /// The returned child must be handed to [`ProcessSupervisor::wait_exit`].
    pub fn start(&self, reason: &str) -> UnitResult<Child> {
        tracing::info!(
            equipment = %self.equipment,
            reason,
            command = %self.command,
            "starting driver process"
        );
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .process_group(0);

        let child = command.spawn().map_err(|e| UnitError::Spawn {
            equipment: self.equipment.clone(),
            message: format!("{}: {}", self.command.program, e),
        })?;

        self.terminating.store(false, Ordering::Release);
        self.exited.send_replace(false);
        *self.pid.lock() = child.id();
        self.starts.fetch_add(1, Ordering::AcqRel);
        tracing::info!(equipment = %self.equipment, pid = ?child.id(), "driver process started");
        Ok(child)
    }

    /// Block until `child` exits and classify the exit.
    pub async fn wait_exit(&self, mut child: Child) -> ExitOutcome {
        let pid = child.id();
        let status = match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::error!(equipment = %self.equipment, error = %e, "failed waiting for driver process");
                None
            }
        };
        self.exited.send_replace(true);

        if self.is_terminating() {
            tracing::debug!(equipment = %self.equipment, pid = ?pid, status = ?status, "driver process stopped");
            ExitOutcome::Planned(status)
        } else {
            tracing::warn!(equipment = %self.equipment, pid = ?pid, status = ?status, "driver process exited");
            ExitOutcome::Unexpected(status)
        }
    }

    /// Terminate, wait out the grace period, then kill the whole group.
    ///
    /// Safe to call repeatedly and when nothing is running.
    pub async fn stop(&self, reason: &str) {
        self.terminating.store(true, Ordering::Release);
        let Some(raw) = self.pid.lock().take() else {
            return;
        };
        let Ok(raw) = i32::try_from(raw) else {
            return;
        };
        let pid = Pid::from_raw(raw);

        let mut exited = self.exited.subscribe();
        let already_exited = *exited.borrow();
        if !already_exited {
            tracing::info!(equipment = %self.equipment, pid = raw, reason, "terminating driver process");
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                if e != Errno::ESRCH {
                    tracing::warn!(equipment = %self.equipment, pid = raw, error = %e, "SIGTERM failed");
                }
            }
            let graceful = matches!(
                tokio::time::timeout(self.stop_grace, exited.wait_for(|done| *done)).await,
                Ok(Ok(_))
            );
            if !graceful {
                tracing::warn!(
                    equipment = %self.equipment,
                    pid = raw,
                    grace = ?self.stop_grace,
                    "driver process ignored SIGTERM, killing process group"
                );
            }
        }

        // Sweep the group for children left behind by the driver.
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(equipment = %self.equipment, pgid = raw, error = %e, "killpg failed")
            }
        }
    }
}
