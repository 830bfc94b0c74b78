use crate::core::nft::NftTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default location of the daemon settings file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sbs/sbsd.json";

/// Upper bound for the expiry scheduler interval, in seconds
pub const MAX_EXPIRY_INTERVAL_SECS: u64 = 60;

/// Daemon settings
///
/// Every field has a default, so a partial (or missing) file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `<list>.conf` files
    pub config_root: PathBuf,
    /// Directory for ticket state and the audit log
    pub state_dir: PathBuf,
    /// Unix socket the RPC server listens on
    pub socket_path: PathBuf,
    /// Expiry scheduler tick, clamped to 1..=60 seconds
    pub expiry_interval_secs: u64,
    /// How often remote allowlist domains are re-resolved
    pub domain_refresh_secs: u64,
    /// Upper bound for a single nft call
    pub apply_timeout_secs: u64,
    pub nft: NftTarget,
    /// Write the JSON-lines audit log
    pub audit_log: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_root: PathBuf::from("/etc/sbs"),
            state_dir: PathBuf::from("/var/lib/sbs"),
            socket_path: PathBuf::from("/var/run/sbs.sock"),
            expiry_interval_secs: 30,
            domain_refresh_secs: 3600,
            apply_timeout_secs: 10,
            nft: NftTarget::default(),
            audit_log: true,
        }
    }
}

impl DaemonConfig {
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs.clamp(1, MAX_EXPIRY_INTERVAL_SECS))
    }

    pub fn domain_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.domain_refresh_secs.max(60))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs.max(1))
    }

    pub fn tickets_path(&self) -> PathBuf {
        self.state_dir.join("tickets.json")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }
}

/// Loads daemon settings from `path`, or returns defaults if the file does
/// not exist.
///
/// # Errors
///
/// A file that exists but cannot be read or parsed is an error: silently
/// running with defaults would point the daemon at the wrong sets.
pub async fn load_config(path: &Path) -> crate::Result<DaemonConfig> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found, using default settings", path.display());
            return Ok(DaemonConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let config: DaemonConfig = serde_json::from_str(&json)?;
    if config.expiry_interval_secs > MAX_EXPIRY_INTERVAL_SECS || config.expiry_interval_secs == 0 {
        warn!(
            "expiry_interval_secs={} out of range, using {}s",
            config.expiry_interval_secs,
            config.expiry_interval().as_secs()
        );
    }
    Ok(config)
}
