//! CLI-only subcommand implementations: `check` and `status`.
//!
//! These commands do not start the management API. They talk to pm2 and the
//! filesystem directly and are useful for debugging a host before or after
//! running `serve`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::instance::InstanceManager;
use crate::supervisor::{Pm2, Supervisor, TlsParams};

/// Load the config file (or defaults), then apply `.env`/environment
/// overrides and make paths absolute.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.resolve_paths()?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `st-factory check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_pm2(config).await,
        check_app_dir(config),
        check_script(config),
        check_writable_dir("Data root", &config.storage.data_root, true),
        check_writable_dir("Backup staging dir", &config.backup.temp_dir, false),
        check_tls(config),
        check_admin_key(config),
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed. Run: st-factory serve --config config.toml");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

async fn check_pm2(config: &Config) -> Check {
    let binary = config.supervisor.pm2_binary.display().to_string();
    match Pm2::new(&config.supervisor).version().await {
        Ok(version) => Check::pass("pm2", format!("{} {}", binary, version)),
        Err(e) => Check::fail(
            "pm2",
            format!("{}: {}", binary, e),
            "Install pm2 (npm install -g pm2) or set supervisor.pm2_binary",
        ),
    }
}

fn check_app_dir(config: &Config) -> Check {
    let dir = &config.supervisor.app_dir;
    if dir.is_dir() {
        Check::pass("Application dir", dir.display().to_string())
    } else {
        Check::fail(
            "Application dir",
            format!("{} not found", dir.display()),
            "Install the application there or set supervisor.app_dir",
        )
    }
}

fn check_script(config: &Config) -> Check {
    let script = config.supervisor.app_dir.join(&config.supervisor.script);
    if script.is_file() {
        Check::pass("Entry script", script.display().to_string())
    } else {
        Check::fail(
            "Entry script",
            format!("{} not found", script.display()),
            "Set supervisor.script to the application's entry point",
        )
    }
}

fn check_writable_dir(label: &'static str, dir: &Path, create: bool) -> Check {
    if create {
        if let Err(e) = std::fs::create_dir_all(dir) {
            return Check::fail(
                label,
                format!("{}: {}", dir.display(), e),
                format!("mkdir -p {} and make it writable by this user", dir.display()),
            );
        }
    }
    match tempfile::tempfile_in(dir) {
        Ok(_) => Check::pass(label, format!("{} (writable)", dir.display())),
        Err(e) => Check::fail(
            label,
            format!("{}: {}", dir.display(), e),
            format!("Make {} writable by this user", dir.display()),
        ),
    }
}

fn check_tls(config: &Config) -> Check {
    let tls = &config.tls;
    if let Some(params) = TlsParams::discover(tls) {
        return Check::pass(
            "TLS material",
            format!(
                "instances launch with HTTPS ({}, {})",
                params.cert_path.display(),
                params.key_path.display()
            ),
        );
    }
    match (tls.cert_path.exists(), tls.key_path.exists()) {
        (false, false) => Check::pass(
            "TLS material",
            format!("not found, instances launch with plain HTTP ({})", tls.cert_path.display()),
        ),
        _ => Check::fail(
            "TLS material",
            format!(
                "only one of {} and {} exists",
                tls.cert_path.display(),
                tls.key_path.display()
            ),
            "Provide both the certificate and the private key, or neither",
        ),
    }
}

fn check_admin_key(config: &Config) -> Check {
    if config.server.admin_key.is_empty() {
        Check::fail(
            "Admin key",
            "not set; every /api/instances request will be refused",
            "Set ADMIN_KEY in the environment or .env, or server.admin_key in the config",
        )
    } else {
        Check::pass("Admin key", "set")
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `st-factory status`: list every instance pm2 knows about, or report
/// on one instance when `id` is given.
pub async fn run_status(config: &Config, id: Option<String>) -> Result<()> {
    if let Some(id) = id {
        let instances = InstanceManager::new(config, Arc::new(Pm2::new(&config.supervisor)));
        println!("{}", describe_instance(&instances, &id).await?);
        return Ok(());
    }

    let pm2 = Pm2::new(&config.supervisor);
    let mut processes = pm2.list_all().await?;
    processes.sort_by_key(|p| p.id.port());

    println!("Instances: {}", processes.len());
    if processes.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:<24} {:<6} {:<10} {:<8} {:<20} {}",
        "ID", "PORT", "STATUS", "PID", "STARTED", "DATA DIR"
    );
    let now = Utc::now();
    for p in &processes {
        let started = p
            .started_at
            .map(|t| format_duration((now - t).to_std().unwrap_or_default()))
            .unwrap_or_else(|| "-".to_string());
        let pid = p.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
        println!(
            "{:<24} {:<6} {:<10} {:<8} {:<20} {}",
            p.id.as_str(),
            p.id.port(),
            p.raw_status,
            pid,
            started,
            config.storage.data_dir(p.id.port()).display()
        );
    }
    Ok(())
}

async fn describe_instance(instances: &InstanceManager, id: &str) -> Result<String> {
    let status = instances.status(id).await?;
    Ok(format!("{}: {}", id, status))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (n, unit) = match secs {
        0..=59 => (secs, "second"),
        60..=3599 => (secs / 60, "minute"),
        3600..=86399 => (secs / 3600, "hour"),
        _ => (secs / 86400, "day"),
    };
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn format_duration_units() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0 seconds ago");
        assert_eq!(format_duration(Duration::from_secs(1)), "1 second ago");
        assert_eq!(format_duration(Duration::from_secs(61)), "1 minute ago");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2 hours ago");
        assert_eq!(format_duration(Duration::from_secs(3 * 86400)), "3 days ago");
    }

    #[test]
    fn tls_check_passes_without_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.tls.cert_path = dir.path().join("cert.pem");
        config.tls.key_path = dir.path().join("privkey.pem");
        assert!(check_tls(&config).ok);

        std::fs::write(&config.tls.cert_path, "cert").unwrap();
        assert!(!check_tls(&config).ok);

        std::fs::write(&config.tls.key_path, "key").unwrap();
        assert!(check_tls(&config).ok);
    }

    #[test]
    fn writable_dir_check_creates_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("user-data");
        assert!(check_writable_dir("Data root", &root, true).ok);
        assert!(root.is_dir());
        assert!(!check_writable_dir("Backup staging dir", &dir.path().join("missing"), false).ok);
    }

    #[tokio::test]
    async fn describe_single_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (_sup, instances) = crate::instance::testing::manager(dir.path());

        assert_eq!(
            describe_instance(&instances, "st-instance-8001").await.unwrap(),
            "st-instance-8001: absent"
        );
        instances.create(Some(8001)).await.unwrap();
        assert_eq!(
            describe_instance(&instances, "st-instance-8001").await.unwrap(),
            "st-instance-8001: running"
        );
        instances.stop("st-instance-8001").await.unwrap();
        assert_eq!(
            describe_instance(&instances, "st-instance-8001").await.unwrap(),
            "st-instance-8001: stopped"
        );
        assert!(describe_instance(&instances, "st-instance-80").await.is_err());
    }

    #[test]
    fn admin_key_check() {
        let mut config = Config::default();
        assert!(!check_admin_key(&config).ok);
        config.server.admin_key = "k".into();
        assert!(check_admin_key(&config).ok);
    }
}
