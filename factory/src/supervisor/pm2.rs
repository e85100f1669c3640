use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{LaunchSpec, ProcessInfo, Supervisor, SupervisorError};
use crate::config::SupervisorConfig;
use crate::instance::{InstanceId, InstanceStatus, Naming};

/// One entry of `pm2 jlist`, reduced to the fields the factory reads.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Pm2Process {
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub pm2_env: Pm2Env,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Pm2Env {
    #[serde(default)]
    pub status: String,
    /// Milliseconds since the epoch at which the current incarnation started.
    #[serde(default)]
    pub pm_uptime: Option<f64>,
}

/// Client for a pm2 daemon, driven through the `pm2` CLI.
///
/// Every invocation passes an argument list straight to the binary (no shell)
/// and is bounded by the configured command timeout. A timed-out pm2 child is
/// killed when its future is dropped.
#[derive(Debug, Clone)]
pub struct Pm2 {
    binary: PathBuf,
    app_dir: PathBuf,
    script: String,
    listen_address: String,
    naming: Naming,
    timeout: Duration,
}

impl Pm2 {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            binary: config.pm2_binary.clone(),
            app_dir: config.app_dir.clone(),
            script: config.script.clone(),
            listen_address: config.listen_address.clone(),
            naming: Naming::new(config.name_prefix.clone()),
            timeout: config.command_timeout(),
        }
    }

    /// The full pm2 process table, including processes that are not instances.
    async fn jlist(&self) -> Result<Vec<Pm2Process>, SupervisorError> {
        let stdout = self.run("jlist", &[], None).await?;
        parse_jlist(&stdout)
    }

    /// `pm2 --version`, used by `st-factory check`. Starts the pm2 daemon if needed.
    pub async fn version(&self) -> Result<String, SupervisorError> {
        let stdout = self.run("--version", &[], None).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("unknown")
            .to_string())
    }

    async fn run(
        &self,
        subcommand: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<String, SupervisorError> {
        // Only the subcommand is logged: launch arguments carry the password.
        debug!(subcommand, "running pm2 command");

        let mut cmd = Command::new(&self.binary);
        cmd.arg(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SupervisorError::Timeout {
                command: subcommand.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::CommandFailed {
                command: subcommand.to_string(),
                detail: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Supervisor for Pm2 {
    async fn inspect(&self, id: &InstanceId) -> Result<Option<ProcessInfo>, SupervisorError> {
        let processes = self.jlist().await?;
        Ok(processes
            .into_iter()
            .find(|p| p.name == id.as_str())
            .and_then(|p| to_process_info(&self.naming, p)))
    }

    async fn list_all(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let processes = self.jlist().await?;
        Ok(processes
            .into_iter()
            .filter_map(|p| to_process_info(&self.naming, p))
            .collect())
    }

    #[instrument(skip(self, spec), fields(instance_id = %spec.id))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        let launch_error = |detail: String| SupervisorError::Launch {
            id: spec.id.to_string(),
            detail,
        };

        // pm2 keeps the launch arguments of a registered process, so a stale
        // entry has to go before the new password can take effect.
        if let Some(existing) = self.inspect(&spec.id).await? {
            if existing.status == InstanceStatus::Running {
                return Err(launch_error("a process with this name is already running".into()));
            }
            debug!(status = %existing.raw_status, "removing stale pm2 registration");
            self.run("delete", &[spec.id.as_str()], None).await?;
        }

        let script = self.app_dir.join(&self.script).display().to_string();
        let app_dir = self.app_dir.display().to_string();
        let mut args: Vec<String> = vec![
            script,
            "--name".into(),
            spec.id.to_string(),
            "--cwd".into(),
            app_dir,
            "--".into(),
        ];
        args.extend(spec.app_args(&self.listen_address));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        self.run("start", &args, Some(&self.app_dir))
            .await
            .map_err(|e| match e {
                SupervisorError::CommandFailed { detail, .. } => launch_error(detail),
                SupervisorError::Io(e) => launch_error(e.to_string()),
                other => other,
            })?;

        match self.inspect(&spec.id).await? {
            Some(p) if p.status == InstanceStatus::Running => {
                info!(pid = ?p.pid, tls = spec.tls.is_some(), "instance process started");
                Ok(())
            }
            Some(p) => Err(launch_error(format!("process is {} after start", p.raw_status))),
            None => Err(launch_error("process not registered after start".into())),
        }
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    async fn stop(&self, id: &InstanceId) -> Result<(), SupervisorError> {
        match self.inspect(id).await? {
            None => return Err(SupervisorError::NotFound(id.to_string())),
            Some(p) if p.status != InstanceStatus::Running => {
                return Err(SupervisorError::NotRunning(id.to_string()))
            }
            Some(_) => {}
        }
        self.run("stop", &[id.as_str()], None).await?;
        info!("instance process stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    async fn remove(&self, id: &InstanceId) -> Result<(), SupervisorError> {
        if self.inspect(id).await?.is_none() {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        self.run("delete", &[id.as_str()], None).await?;
        info!("instance process removed from pm2");
        Ok(())
    }
}

/// Map a pm2 status word onto instance liveness.
///
/// `launching` counts as running: pm2 reports it for the short window between
/// spawn and the process becoming `online`.
pub(crate) fn map_status(raw: &str) -> InstanceStatus {
    match raw {
        "online" | "launching" => InstanceStatus::Running,
        _ => InstanceStatus::Stopped,
    }
}

/// Convert a pm2 entry into a [`ProcessInfo`], or `None` if its name is not
/// an instance id.
pub(crate) fn to_process_info(naming: &Naming, process: Pm2Process) -> Option<ProcessInfo> {
    let id = match naming.parse(&process.name) {
        Ok(id) => id,
        Err(e) => {
            if process.name.starts_with(naming.prefix()) {
                warn!(name = %process.name, error = %e, "skipping pm2 process with malformed instance name");
            }
            return None;
        }
    };

    let started_at = process
        .pm2_env
        .pm_uptime
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64));

    Some(ProcessInfo {
        id,
        status: map_status(&process.pm2_env.status),
        raw_status: process.pm2_env.status,
        started_at,
        pid: process.pid.filter(|&pid| pid != 0),
    })
}

/// Parse `pm2 jlist` output.
///
/// pm2 may print banner lines such as `[PM2] Spawning PM2 daemon` before the
/// JSON array, so the first `[` that starts a parseable array wins. Entries
/// that do not match the expected shape are skipped.
pub(crate) fn parse_jlist(output: &str) -> Result<Vec<Pm2Process>, SupervisorError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries = output
        .match_indices('[')
        .find_map(|(idx, _)| {
            serde_json::Deserializer::from_str(&output[idx..])
                .into_iter::<Vec<serde_json::Value>>()
                .next()
                .and_then(Result::ok)
        })
        .ok_or_else(|| SupervisorError::Parse("no JSON process list in pm2 jlist output".into()))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Pm2Process>(entry) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "skipping unreadable pm2 process entry");
                None
            }
        })
        .collect())
}
