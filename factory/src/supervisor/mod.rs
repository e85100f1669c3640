pub mod pm2;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TlsConfig;
use crate::credential::Credential;
use crate::instance::{InstanceId, InstanceStatus};

pub use pm2::Pm2;

/// Errors from the external process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process {0} is not registered with the supervisor")]
    NotFound(String),

    #[error("process {0} is not running")]
    NotRunning(String),

    #[error("failed to launch {id}: {detail}")]
    Launch { id: String, detail: String },

    #[error("supervisor command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("supervisor command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("unexpected supervisor output: {0}")]
    Parse(String),

    #[error("failed to execute supervisor: {0}")]
    Io(#[from] std::io::Error),
}

/// One managed process as reported by the supervisor.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: InstanceId,
    /// `Running` or `Stopped`; absence is expressed by not returning an entry.
    pub status: InstanceStatus,
    /// The supervisor's own status word (e.g. pm2's `errored`), for diagnostics.
    pub raw_status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

/// TLS certificate and key handed to an instance at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsParams {
    /// Probe the configured paths. TLS is only used when both files exist.
    pub fn discover(config: &TlsConfig) -> Option<Self> {
        if config.cert_path.is_file() && config.key_path.is_file() {
            Some(Self {
                cert_path: config.cert_path.clone(),
                key_path: config.key_path.clone(),
            })
        } else {
            None
        }
    }
}

/// Everything needed to start one incarnation of an instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: InstanceId,
    pub data_dir: PathBuf,
    pub password: Credential,
    pub tls: Option<TlsParams>,
}

impl LaunchSpec {
    /// Arguments passed through to the instance application.
    ///
    /// The set is fixed so that every incarnation of an instance launches the
    /// same way apart from its password and TLS material.
    pub fn app_args(&self, listen_address: &str) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.id.port().to_string(),
            "--dataRoot".to_string(),
            self.data_dir.display().to_string(),
            "--listen".to_string(),
            "true".to_string(),
            "--listenAddressIPv4".to_string(),
            listen_address.to_string(),
            "--whitelistMode".to_string(),
            "false".to_string(),
            "--basicAuthMode".to_string(),
            "true".to_string(),
            "--basicAuthUserName".to_string(),
            self.id.as_str().to_string(),
            "--basicAuthUserPassword".to_string(),
            self.password.expose().to_string(),
            "--enableUserAccounts".to_string(),
            "true".to_string(),
            "--enableDiscreetLogin".to_string(),
            "true".to_string(),
            "--autorun".to_string(),
            "false".to_string(),
        ];
        if let Some(tls) = &self.tls {
            args.push("--ssl=true".to_string());
            args.push(format!("--certPath={}", tls.cert_path.display()));
            args.push(format!("--keyPath={}", tls.key_path.display()));
        }
        args
    }
}

/// Control surface of the external process supervisor.
///
/// The supervisor's process table is the system of record for instance
/// liveness; implementations hold no state of their own between calls.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Look up a single process. `Ok(None)` when it is not registered.
    async fn inspect(&self, id: &InstanceId) -> Result<Option<ProcessInfo>, SupervisorError>;

    /// Every registered process whose name is a well-formed instance id.
    async fn list_all(&self) -> Result<Vec<ProcessInfo>, SupervisorError>;

    /// Start a new managed process, replacing any stale registration.
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SupervisorError>;

    /// Gracefully stop a running process, keeping its registration.
    async fn stop(&self, id: &InstanceId) -> Result<(), SupervisorError>;

    /// Drop the process from the supervisor's bookkeeping.
    async fn remove(&self, id: &InstanceId) -> Result<(), SupervisorError>;
}
