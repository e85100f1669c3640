use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the st-factory daemon.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub storage: StorageConfig,
    pub tls: TlsConfig,
    pub backup: BackupConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ADMIN_KEY` and `PORT` from the environment on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var("ADMIN_KEY").ok(),
            std::env::var("PORT").ok(),
        )
    }

    fn apply_overrides(&mut self, admin_key: Option<String>, port: Option<String>) -> Result<()> {
        if let Some(key) = admin_key.filter(|k| !k.trim().is_empty()) {
            self.server.admin_key = key;
        }
        if let Some(port) = port {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {}", port))?;
        }
        Ok(())
    }

    /// Make every relative path absolute against the current working directory.
    ///
    /// pm2 launches instances from `supervisor.app_dir`, so the data root and
    /// TLS paths handed to it must not depend on the daemon's cwd.
    pub fn resolve_paths(&mut self) -> Result<()> {
        for path in [
            &mut self.supervisor.app_dir,
            &mut self.storage.data_root,
            &mut self.tls.cert_path,
            &mut self.tls.key_path,
            &mut self.backup.temp_dir,
        ] {
            if path.is_relative() {
                let absolute = std::path::absolute(&*path)
                    .with_context(|| format!("resolving path: {}", path.display()))?;
                *path = absolute;
            }
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.supervisor.name_prefix.is_empty(),
            "supervisor.name_prefix must not be empty"
        );
        anyhow::ensure!(
            !self.supervisor.name_prefix.ends_with('-'),
            "supervisor.name_prefix must not end with '-' (the separator is added automatically)"
        );
        anyhow::ensure!(
            self.supervisor.command_timeout_secs >= 1,
            "supervisor.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            !self.supervisor.script.is_empty(),
            "supervisor.script must not be empty"
        );
        anyhow::ensure!(
            self.backup.timeout_secs >= 1,
            "backup.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            (0..=9).contains(&self.backup.compression_level),
            "backup.compression_level must be between 0 and 9"
        );
        Ok(())
    }
}

// The admin key must never reach the logs, so Debug is written by hand.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("supervisor", &self.supervisor)
            .field("storage", &self.storage)
            .field("tls", &self.tls)
            .field("backup", &self.backup)
            .finish()
    }
}

/// HTTP API configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the management API binds to.
    pub bind_addr: String,
    /// Port the management API listens on.
    pub port: u16,
    /// Shared secret expected in the `X-ST-Admin-Key` header.
    /// Empty means "not configured" and every instance request fails.
    pub admin_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 3000,
            admin_key: String::new(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("admin_key", &if self.admin_key.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

/// pm2 process supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Path or name of the pm2 binary.
    pub pm2_binary: PathBuf,
    /// Directory containing the application that every instance runs.
    pub app_dir: PathBuf,
    /// Entry script inside `app_dir`.
    pub script: String,
    /// Instance name prefix; ids look like `{prefix}-{port}`.
    pub name_prefix: String,
    /// Address instances listen on.
    pub listen_address: String,
    /// Upper bound for any single pm2 invocation.
    pub command_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pm2_binary: PathBuf::from("pm2"),
            app_dir: PathBuf::from("stsource"),
            script: "server.js".into(),
            name_prefix: "st-instance".into(),
            listen_address: "0.0.0.0".into(),
            command_timeout_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Instance data storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which each instance owns `{data_root}/{port}`.
    pub data_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("user-data"),
        }
    }
}

impl StorageConfig {
    /// Data directory of the instance bound to `port`.
    pub fn data_dir(&self, port: u16) -> PathBuf {
        self.data_root.join(port.to_string())
    }
}

/// TLS material handed to instances when both files exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("certs/cert.pem"),
            key_path: PathBuf::from("certs/privkey.pem"),
        }
    }
}

/// Backup archive production.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Where archives are staged before being streamed to the client.
    pub temp_dir: PathBuf,
    /// Upper bound for producing a single archive.
    pub timeout_secs: u64,
    /// Deflate level, 0-9.
    pub compression_level: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            timeout_secs: 600,
            compression_level: 9,
        }
    }
}

impl BackupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert!(config.server.admin_key.is_empty());
        assert_eq!(config.supervisor.pm2_binary, PathBuf::from("pm2"));
        assert_eq!(config.supervisor.script, "server.js");
        assert_eq!(config.supervisor.name_prefix, "st-instance");
        assert_eq!(config.supervisor.command_timeout_secs, 30);
        assert_eq!(config.storage.data_root, PathBuf::from("user-data"));
        assert_eq!(config.tls.cert_path, PathBuf::from("certs/cert.pem"));
        assert_eq!(config.backup.compression_level, 9);
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[server]
port = 8080
admin_key = "s3cret"

[supervisor]
app_dir = "/opt/sillytavern"
name_prefix = "tenant"

[storage]
data_root = "/srv/tenants"
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        tmpfile.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(tmpfile.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_key, "s3cret");
        assert_eq!(config.supervisor.app_dir, PathBuf::from("/opt/sillytavern"));
        assert_eq!(config.supervisor.name_prefix, "tenant");
        // Unset fields use defaults
        assert_eq!(config.supervisor.script, "server.js");
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.storage.data_dir(8001), PathBuf::from("/srv/tenants/8001"));
    }

    #[test]
    fn config_validation_rejects_bad_prefix() {
        let mut config = Config::default();
        config.supervisor.name_prefix = String::new();
        assert!(config.validate().is_err());

        config.supervisor.name_prefix = "st-".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_compression_out_of_range() {
        let mut config = Config::default();
        config.backup.compression_level = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.supervisor.command_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backup.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = Config::default();
        config
            .apply_overrides(Some("from-env".into()), Some("4000".into()))
            .unwrap();
        assert_eq!(config.server.admin_key, "from-env");
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn blank_env_admin_key_is_ignored() {
        let mut config = Config::default();
        config.server.admin_key = "from-file".into();
        config.apply_overrides(Some("  ".into()), None).unwrap();
        assert_eq!(config.server.admin_key, "from-file");
    }

    #[test]
    fn invalid_env_port_is_rejected() {
        let mut config = Config::default();
        assert!(config.apply_overrides(None, Some("http".into())).is_err());
    }

    #[test]
    fn resolve_paths_makes_paths_absolute() {
        let mut config = Config::default();
        config.resolve_paths().unwrap();
        assert!(config.storage.data_root.is_absolute());
        assert!(config.supervisor.app_dir.is_absolute());
        assert!(config.tls.key_path.is_absolute());
        // Bare binary names stay on $PATH lookup
        assert_eq!(config.supervisor.pm2_binary, PathBuf::from("pm2"));
    }

    #[test]
    fn debug_output_redacts_admin_key() {
        let mut config = Config::default();
        config.server.admin_key = "top-secret-value".into();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("top-secret-value"));
        assert!(rendered.contains("<redacted>"));
    }
}
