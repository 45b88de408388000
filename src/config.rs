use crate::entitlement::DEFAULT_SWEEP_INTERVAL_SECS;
use crate::ids::ControllerId;
use crate::lifecycle::machine::ClosePolicy;
use crate::lifecycle::LifecycleConfig;
use crate::network::DEFAULT_FATAL_STATUSES;
use crate::paths::StoragePaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, loaded from YAML.
///
/// Every field is optional in the file; missing fields fall back to the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Storage root. Default: `$SESSIONPOOL_HOME` or `~/.sessionpool/`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Controller allowed to run owner-only commands.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Address of the messaging gateway.
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    /// Consecutive failed reconnects before a tenant goes dormant. Unset retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_pairing_code_delay_ms")]
    pub pairing_code_delay_ms: u64,
    #[serde(default = "default_entitlement_sweep_secs")]
    pub entitlement_sweep_secs: u64,
    /// Pause before exiting after a reconciliation removed ghosts.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// Close statuses that evict a tenant instead of reconnecting it.
    #[serde(default = "default_fatal_status_codes")]
    pub fatal_status_codes: Vec<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write logs to `<root>/logs/sessionpool.log`.
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            owner_id: None,
            gateway_addr: default_gateway_addr(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            max_reconnect_attempts: None,
            pairing_code_delay_ms: default_pairing_code_delay_ms(),
            entitlement_sweep_secs: default_entitlement_sweep_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            fatal_status_codes: default_fatal_status_codes(),
            log_level: default_log_level(),
            log_to_file: false,
        }
    }
}

fn default_gateway_addr() -> String {
    "127.0.0.1:7800".to_string()
}

fn default_reconnect_backoff_secs() -> u64 {
    4
}

fn default_pairing_code_delay_ms() -> u64 {
    1000
}

fn default_entitlement_sweep_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_restart_delay_secs() -> u64 {
    3
}

fn default_fatal_status_codes() -> Vec<u16> {
    DEFAULT_FATAL_STATUSES.to_vec()
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(owner) = &self.owner_id {
            ControllerId::parse(owner)
                .with_context(|| format!("Invalid owner_id '{}'", owner))?;
        }

        if self.gateway_addr.trim().is_empty() {
            anyhow::bail!("gateway_addr must not be empty");
        }

        if self.entitlement_sweep_secs == 0 {
            anyhow::bail!("entitlement_sweep_secs must be at least 1");
        }

        if self.max_reconnect_attempts == Some(0) {
            anyhow::bail!("max_reconnect_attempts must be at least 1 when set");
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            anyhow::bail!(
                "Unknown log_level '{}' (expected one of: {})",
                self.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Resolves the storage root: `data_dir` if configured, else the default root.
    pub fn storage_paths(&self) -> Result<StoragePaths> {
        let root = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => StoragePaths::default_root()?,
        };
        Ok(StoragePaths::new(root))
    }

    pub fn owner(&self) -> Option<ControllerId> {
        self.owner_id
            .as_deref()
            .and_then(|raw| ControllerId::parse(raw).ok())
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            pairing_code_delay: Duration::from_millis(self.pairing_code_delay_ms),
            policy: ClosePolicy::new(self.fatal_status_codes.iter().copied()),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.entitlement_sweep_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
