//! Storage layout for everything the session manager persists.
//!
//! All durable state lives under a single root (default `~/.sessionpool/`):
//! - `sessions/device<tenant>/` - Per-tenant credential directory
//! - `sessions/active_sessions.json` - Previously-active tenants
//! - `pairings.json` - Controller to tenant pairings
//! - `entitlements.json` - Controller entitlement expiries
//! - `logs/` - Optional file log sink

use crate::ids::TenantId;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the storage root.
pub const HOME_ENV: &str = "SESSIONPOOL_HOME";

/// Directory name of the default storage root, under the user's home.
const DEFAULT_DIR: &str = ".sessionpool";

/// Prefix of every tenant credential directory.
const DEVICE_PREFIX: &str = "device";

/// Resolved storage paths rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns `$SESSIONPOOL_HOME` if set, otherwise `~/.sessionpool/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn default_root() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().context("Could not determine home directory for storage")?;
        Ok(home.join(DEFAULT_DIR))
    }

    /// Creates the root, sessions and logs directories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.sessions_dir(), self.logs_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the sessions root: `<root>/sessions/`
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Returns a tenant's credential directory: `<root>/sessions/device<tenant>/`
    pub fn credential_dir(&self, tenant: &TenantId) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}{}", DEVICE_PREFIX, tenant.as_str()))
    }

    /// Returns the previously-active list: `<root>/sessions/active_sessions.json`
    pub fn active_sessions_path(&self) -> PathBuf {
        self.sessions_dir().join("active_sessions.json")
    }

    /// Returns the pairing table: `<root>/pairings.json`
    pub fn pairings_path(&self) -> PathBuf {
        self.root.join("pairings.json")
    }

    /// Returns the entitlement table: `<root>/entitlements.json`
    pub fn entitlements_path(&self) -> PathBuf {
        self.root.join("entitlements.json")
    }

    /// Returns the logs directory: `<root>/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
#[path = "tests/paths_tests.rs"]
mod tests;
