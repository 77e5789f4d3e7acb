//! Store settings loaded from environment variables.
//!
//! Every setting has a default matching the container layout
//! (`/data/stealth-vpn`), so the admin tooling starts with zero
//! configuration on a standard deployment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retention::RetentionPolicy;

pub const STORE_FILE_NAME: &str = "users.json";
pub const LOCK_FILE_NAME: &str = ".users.lock";
pub const ENDPOINTS_FILE_NAME: &str = "endpoints.json";
pub const DEFAULT_DATA_DIR: &str = "/data/stealth-vpn";

/// Paths and policies shared by every store component.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Root of the deployment's data.
    /// Env: `UMBRA_DATA_DIR`
    /// Default: `/data/stealth-vpn`
    pub data_dir: PathBuf,

    /// Live configuration tree holding `users.json`, the per-protocol server
    /// configs and the per-user client configs.
    /// Env: `UMBRA_CONFIG_DIR`
    /// Default: `<data_dir>/configs`
    pub config_dir: PathBuf,

    /// Where document snapshots, archives and endpoint backups go.
    /// Env: `UMBRA_BACKUP_DIR`
    /// Default: `<data_dir>/backups`
    pub backup_dir: PathBuf,

    /// Endpoint set consumed by the reverse proxy.
    /// Env: `UMBRA_ENDPOINTS_FILE`
    /// Default: `<data_dir>/endpoints.json`
    pub endpoints_file: PathBuf,

    /// TLS certificates captured by backups (best-effort).
    /// Env: `UMBRA_CERTS_DIR`
    pub certificates_dir: Option<PathBuf>,

    /// Reverse-proxy config captured by backups (best-effort).
    /// Env: `UMBRA_PROXY_CONFIG`
    pub proxy_config: Option<PathBuf>,

    /// Orchestration manifest captured by backups, never auto-restored.
    /// Env: `UMBRA_COMPOSE_FILE`
    pub orchestration_manifest: Option<PathBuf>,

    /// Bounded wait for the store lock.
    /// Env: `UMBRA_LOCK_TIMEOUT_SECS`
    /// Default: `10`
    pub lock_timeout: Duration,

    /// Env: `UMBRA_AUTO_BACKUP_KEEP` (default 10), `UMBRA_BACKUP_CEILING` (default 20)
    pub retention: RetentionPolicy,

    /// Age after which `EndpointRotator::generate` replaces the set.
    /// Env: `UMBRA_ENDPOINT_ROTATION_DAYS`
    /// Default: `30`
    pub endpoint_rotation_days: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::for_data_dir(DEFAULT_DATA_DIR)
    }
}

impl StoreSettings {
    /// Standard layout rooted at `data_dir`.
    pub fn for_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            config_dir: data_dir.join("configs"),
            backup_dir: data_dir.join("backups"),
            endpoints_file: data_dir.join(ENDPOINTS_FILE_NAME),
            data_dir,
            certificates_dir: None,
            proxy_config: None,
            orchestration_manifest: None,
            lock_timeout: Duration::from_secs(10),
            retention: RetentionPolicy::default(),
            endpoint_rotation_days: 30,
        }
    }

    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("UMBRA_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        let mut settings = Self::for_data_dir(data_dir);

        if let Ok(dir) = std::env::var("UMBRA_CONFIG_DIR") {
            settings.config_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("UMBRA_BACKUP_DIR") {
            settings.backup_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("UMBRA_ENDPOINTS_FILE") {
            settings.endpoints_file = PathBuf::from(file);
        }

        settings.certificates_dir = env_path("UMBRA_CERTS_DIR");
        settings.proxy_config = env_path("UMBRA_PROXY_CONFIG");
        settings.orchestration_manifest = env_path("UMBRA_COMPOSE_FILE");

        if let Some(secs) = env_number::<u64>("UMBRA_LOCK_TIMEOUT_SECS") {
            settings.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(keep) = env_number::<usize>("UMBRA_AUTO_BACKUP_KEEP") {
            settings.retention.keep_auto = keep;
        }
        if let Some(ceiling) = env_number::<usize>("UMBRA_BACKUP_CEILING") {
            settings.retention.ceiling = ceiling;
        }
        if let Some(days) = env_number::<u32>("UMBRA_ENDPOINT_ROTATION_DAYS") {
            settings.endpoint_rotation_days = days;
        }

        settings
    }

    pub fn store_file(&self) -> PathBuf {
        self.config_dir.join(STORE_FILE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.config_dir.join(LOCK_FILE_NAME)
    }

    /// Whether every enhanced (non-legacy) backup source is configured.
    pub fn has_enhanced_sources(&self) -> bool {
        self.certificates_dir.is_some()
            && self.proxy_config.is_some()
            && self.orchestration_manifest.is_some()
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}
