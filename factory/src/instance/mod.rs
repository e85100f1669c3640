pub mod id;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use crate::backup::{self, ArchiveError, TempArchive};
use crate::config::{BackupConfig, Config, StorageConfig, TlsConfig};
use crate::credential::Credential;
use crate::supervisor::{LaunchSpec, Supervisor, SupervisorError, TlsParams};

pub use id::{port_in_range, InstanceId, InvalidId, Naming};

/// Liveness of an instance as derived from the supervisor's process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Absent,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// Errors surfaced by instance lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("port is required")]
    MissingPort,

    #[error("invalid port {0}: must be an integer between 1024 and 65535")]
    InvalidPort(String),

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("port {0} is already used by a running instance")]
    PortInUse(u16),

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup failed: {0}")]
    Backup(#[from] ArchiveError),

    #[error(
        "delete of {id} incomplete (process removed: {process_removed}, data removed: {data_removed})"
    )]
    DeleteIncomplete {
        id: String,
        process_removed: bool,
        data_removed: bool,
    },
}

/// One row of the instance listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub port: u16,
    pub status: InstanceStatus,
    pub start_time: Option<DateTime<Utc>>,
}

/// Result of `create`. Carries the only copy of the password ever disclosed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedInstance {
    pub id: InstanceId,
    pub port: u16,
    pub data_dir: PathBuf,
    pub status: InstanceStatus,
    pub start_time: DateTime<Utc>,
    pub password: Credential,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedInstance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub stop_time: DateTime<Utc>,
}

/// Result of `reset_credentials`. Carries the only copy of the new password.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetCredentials {
    pub id: InstanceId,
    pub password: Credential,
}

/// A finished backup, staged on disk until it has been sent.
#[derive(Debug)]
pub struct BackupArchive {
    pub id: InstanceId,
    /// Download name, `{id}-backup-{timestamp}.zip`.
    pub file_name: String,
    pub size: u64,
    /// Staged archive; removed from disk when dropped.
    pub archive: TempArchive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    AlreadyAbsent,
    Failed,
}

/// Orchestrates instance lifecycle on top of the process supervisor.
///
/// Holds no record of instances: the supervisor's process table is the source
/// of truth and is queried on every call. The only local state is one async
/// mutex per port, so that lifecycle transitions of the same instance run one
/// at a time. Backups do not take that mutex and may run alongside anything.
pub struct InstanceManager {
    supervisor: Arc<dyn Supervisor>,
    naming: Naming,
    storage: StorageConfig,
    tls: TlsConfig,
    backup: BackupConfig,
    locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl InstanceManager {
    pub fn new(config: &Config, supervisor: Arc<dyn Supervisor>) -> Self {
        Self {
            supervisor,
            naming: Naming::new(config.supervisor.name_prefix.clone()),
            storage: config.storage.clone(),
            tls: config.tls.clone(),
            backup: config.backup.clone(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Data directory owned by the instance on `port`.
    pub fn data_dir(&self, port: u16) -> PathBuf {
        self.storage.data_dir(port)
    }

    /// Serialize lifecycle transitions for one instance.
    async fn lock_instance(&self, port: u16) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(port).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Validate a requested port. `None` means the caller sent no port at all.
    pub fn validate_port(port: Option<i64>) -> Result<u16, InstanceError> {
        let port = port.ok_or(InstanceError::MissingPort)?;
        u16::try_from(port)
            .ok()
            .filter(|p| port_in_range(*p))
            .ok_or_else(|| InstanceError::InvalidPort(port.to_string()))
    }

    /// absent|stopped -> running. Fails with `PortInUse`, without touching the
    /// supervisor, when the instance for this port is already running.
    #[instrument(skip(self))]
    pub async fn create(&self, port: Option<i64>) -> Result<CreatedInstance, InstanceError> {
        let port = Self::validate_port(port)?;
        let id = self.naming.id_for(port);
        let _guard = self.lock_instance(port).await;

        if let Some(existing) = self.supervisor.inspect(&id).await? {
            if existing.status == InstanceStatus::Running {
                return Err(InstanceError::PortInUse(port));
            }
        }

        let data_dir = self.data_dir(port);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| InstanceError::Filesystem {
                path: data_dir.clone(),
                source,
            })?;

        let password = Credential::generate();
        self.supervisor
            .launch(&LaunchSpec {
                id: id.clone(),
                data_dir: data_dir.clone(),
                password: password.clone(),
                tls: TlsParams::discover(&self.tls),
            })
            .await?;

        info!(instance_id = %id, port, "instance created");
        Ok(CreatedInstance {
            id,
            port,
            data_dir,
            status: InstanceStatus::Running,
            start_time: Utc::now(),
            password,
        })
    }

    /// Every instance the supervisor knows about, ordered by port.
    pub async fn list(&self) -> Result<Vec<InstanceSummary>, InstanceError> {
        let mut instances: Vec<InstanceSummary> = self
            .supervisor
            .list_all()
            .await?
            .into_iter()
            .map(|p| InstanceSummary {
                port: p.id.port(),
                id: p.id,
                status: p.status,
                start_time: p.started_at,
            })
            .collect();
        instances.sort_by_key(|i| i.port);
        Ok(instances)
    }

    /// Liveness of a single instance.
    pub async fn status(&self, raw_id: &str) -> Result<InstanceStatus, InstanceError> {
        let id = self.naming.parse(raw_id)?;
        Ok(self
            .supervisor
            .inspect(&id)
            .await?
            .map_or(InstanceStatus::Absent, |p| p.status))
    }

    /// running -> stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self, raw_id: &str) -> Result<StoppedInstance, InstanceError> {
        let id = self.naming.parse(raw_id)?;
        let _guard = self.lock_instance(id.port()).await;

        match self.supervisor.inspect(&id).await? {
            None => return Err(InstanceError::NotFound(id.to_string())),
            Some(p) if p.status != InstanceStatus::Running => {
                return Err(InstanceError::NotRunning(id.to_string()))
            }
            Some(_) => {}
        }

        self.supervisor.stop(&id).await.map_err(|e| match e {
            SupervisorError::NotFound(_) => InstanceError::NotFound(id.to_string()),
            SupervisorError::NotRunning(_) => InstanceError::NotRunning(id.to_string()),
            other => other.into(),
        })?;

        info!(instance_id = %id, "instance stopped");
        Ok(StoppedInstance {
            id,
            status: InstanceStatus::Stopped,
            stop_time: Utc::now(),
        })
    }

    /// running|stopped -> running with a new password. Port and data directory
    /// stay the same; the previous password dies with the old process.
    #[instrument(skip(self))]
    pub async fn reset_credentials(&self, raw_id: &str) -> Result<ResetCredentials, InstanceError> {
        let id = self.naming.parse(raw_id)?;
        let _guard = self.lock_instance(id.port()).await;

        if self.supervisor.inspect(&id).await?.is_none() {
            return Err(InstanceError::NotFound(id.to_string()));
        }

        let password = Credential::generate();

        match self.supervisor.stop(&id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.supervisor
            .launch(&LaunchSpec {
                id: id.clone(),
                data_dir: self.data_dir(id.port()),
                password: password.clone(),
                tls: TlsParams::discover(&self.tls),
            })
            .await?;

        info!(instance_id = %id, "instance credentials reset");
        Ok(ResetCredentials { id, password })
    }

    /// running|stopped -> absent. Irreversible.
    ///
    /// The supervisor entry goes first. The data directory is only erased once
    /// no process can be writing to it; if supervisor removal fails, both the
    /// process and the data are left in place and reported as such.
    #[instrument(skip(self))]
    pub async fn delete(&self, raw_id: &str) -> Result<(), InstanceError> {
        let id = self.naming.parse(raw_id)?;
        let _guard = self.lock_instance(id.port()).await;
        let data_dir = self.data_dir(id.port());

        let process = match self.supervisor.remove(&id).await {
            Ok(()) => Removal::Removed,
            Err(SupervisorError::NotFound(_)) => Removal::AlreadyAbsent,
            Err(e) => {
                error!(instance_id = %id, error = %e, "failed to remove instance from supervisor");
                Removal::Failed
            }
        };

        let data = if process == Removal::Failed {
            Removal::Failed
        } else {
            match tokio::fs::remove_dir_all(&data_dir).await {
                Ok(()) => Removal::Removed,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Removal::AlreadyAbsent,
                Err(e) => {
                    error!(
                        instance_id = %id,
                        path = %data_dir.display(),
                        error = %e,
                        "failed to remove instance data directory"
                    );
                    Removal::Failed
                }
            }
        };

        match (process, data) {
            (Removal::AlreadyAbsent, Removal::AlreadyAbsent) => {
                Err(InstanceError::NotFound(id.to_string()))
            }
            (Removal::Failed, _) | (_, Removal::Failed) => Err(InstanceError::DeleteIncomplete {
                id: id.to_string(),
                process_removed: process != Removal::Failed,
                data_removed: data != Removal::Failed,
            }),
            _ => {
                info!(instance_id = %id, ?process, ?data, "instance deleted");
                Ok(())
            }
        }
    }

    /// Archive the instance's data directory, in any state, without stopping
    /// it. Writes happening during the run may or may not be captured.
    #[instrument(skip(self))]
    pub async fn backup(&self, raw_id: &str) -> Result<BackupArchive, InstanceError> {
        let id = self.naming.parse(raw_id)?;
        let data_dir = self.data_dir(id.port());

        match tokio::fs::metadata(&data_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(InstanceError::NotFound(id.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InstanceError::NotFound(id.to_string()))
            }
            Err(source) => {
                return Err(InstanceError::Filesystem {
                    path: data_dir,
                    source,
                })
            }
        }

        let file_name = backup::file_name(&id, Utc::now());
        let (file, archive) = TempArchive::create(&self.backup.temp_dir, id.as_str())?;
        let root = id.port().to_string();
        let level = self.backup.compression_level;
        let source = data_dir.clone();

        let task = tokio::task::spawn_blocking(move || {
            backup::write_archive(&source, &root, level, std::io::BufWriter::new(file))
        });

        let size = run_with_timeout(self.backup.timeout(), task).await?;

        info!(instance_id = %id, bytes = size, "backup archive produced");
        Ok(BackupArchive {
            id,
            file_name,
            size,
            archive,
        })
    }
}

async fn run_with_timeout(
    limit: Duration,
    task: tokio::task::JoinHandle<Result<u64, ArchiveError>>,
) -> Result<u64, ArchiveError> {
    match tokio::time::timeout(limit, task).await {
        Err(_) => {
            warn!(secs = limit.as_secs(), "backup archive timed out");
            Err(ArchiveError::Timeout(limit.as_secs()))
        }
        Ok(Err(join)) => Err(ArchiveError::Interrupted(join.to_string())),
        Ok(Ok(result)) => result,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory supervisor for exercising the orchestrator and the API.

    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::supervisor::ProcessInfo;

    #[derive(Debug, Clone)]
    pub struct FakeProcess {
        pub running: bool,
        pub password: String,
        pub data_dir: PathBuf,
        pub tls: bool,
        pub started_at: DateTime<Utc>,
    }

    /// Records every mutation so tests can assert on what was (not) done.
    #[derive(Default)]
    pub struct FakeSupervisor {
        pub processes: StdMutex<BTreeMap<String, (InstanceId, FakeProcess)>>,
        pub mutations: StdMutex<Vec<String>>,
        pub fail_launch: StdMutex<bool>,
        pub fail_remove: StdMutex<bool>,
    }

    impl FakeSupervisor {
        pub fn process(&self, id: &str) -> Option<FakeProcess> {
            self.processes.lock().unwrap().get(id).map(|(_, p)| p.clone())
        }

        pub fn mutation_count(&self) -> usize {
            self.mutations.lock().unwrap().len()
        }

        fn record(&self, what: String) {
            self.mutations.lock().unwrap().push(what);
        }
    }

    fn info(id: &InstanceId, p: &FakeProcess) -> ProcessInfo {
        ProcessInfo {
            id: id.clone(),
            status: if p.running {
                InstanceStatus::Running
            } else {
                InstanceStatus::Stopped
            },
            raw_status: if p.running { "online" } else { "stopped" }.to_string(),
            started_at: Some(p.started_at),
            pid: p.running.then_some(4242),
        }
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn inspect(&self, id: &InstanceId) -> Result<Option<ProcessInfo>, SupervisorError> {
            Ok(self
                .processes
                .lock()
                .unwrap()
                .get(id.as_str())
                .map(|(id, p)| info(id, p)))
        }

        async fn list_all(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
            Ok(self
                .processes
                .lock()
                .unwrap()
                .values()
                .map(|(id, p)| info(id, p))
                .collect())
        }

        async fn launch(&self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
            self.record(format!("launch {}", spec.id));
            if *self.fail_launch.lock().unwrap() {
                return Err(SupervisorError::Launch {
                    id: spec.id.to_string(),
                    detail: "spawn failed".into(),
                });
            }
            let mut processes = self.processes.lock().unwrap();
            if processes.get(spec.id.as_str()).is_some_and(|(_, p)| p.running) {
                return Err(SupervisorError::Launch {
                    id: spec.id.to_string(),
                    detail: "already running".into(),
                });
            }
            processes.insert(
                spec.id.to_string(),
                (
                    spec.id.clone(),
                    FakeProcess {
                        running: true,
                        password: spec.password.expose().to_string(),
                        data_dir: spec.data_dir.clone(),
                        tls: spec.tls.is_some(),
                        started_at: Utc::now(),
                    },
                ),
            );
            Ok(())
        }

        async fn stop(&self, id: &InstanceId) -> Result<(), SupervisorError> {
            self.record(format!("stop {}", id));
            let mut processes = self.processes.lock().unwrap();
            match processes.get_mut(id.as_str()) {
                None => Err(SupervisorError::NotFound(id.to_string())),
                Some((_, p)) if !p.running => Err(SupervisorError::NotRunning(id.to_string())),
                Some((_, p)) => {
                    p.running = false;
                    Ok(())
                }
            }
        }

        async fn remove(&self, id: &InstanceId) -> Result<(), SupervisorError> {
            self.record(format!("remove {}", id));
            if *self.fail_remove.lock().unwrap() {
                return Err(SupervisorError::CommandFailed {
                    command: "delete".into(),
                    detail: "pm2 daemon unreachable".into(),
                });
            }
            match self.processes.lock().unwrap().remove(id.as_str()) {
                Some(_) => Ok(()),
                None => Err(SupervisorError::NotFound(id.to_string())),
            }
        }
    }

    /// A manager backed by a fake supervisor, with data and temp dirs inside `root`.
    pub fn manager(root: &std::path::Path) -> (Arc<FakeSupervisor>, InstanceManager) {
        let supervisor = Arc::new(FakeSupervisor::default());
        let mut config = Config::default();
        config.storage.data_root = root.join("user-data");
        config.tls.cert_path = root.join("certs/cert.pem");
        config.tls.key_path = root.join("certs/privkey.pem");
        config.backup.temp_dir = root.join("tmp");
        std::fs::create_dir_all(&config.backup.temp_dir).unwrap();
        let manager = InstanceManager::new(&config, supervisor.clone());
        (supervisor, manager)
    }
}
