//! Time-boxed controller entitlements.
//!
//! An entry whose `expires_at` is not in the future is treated as absent on
//! every check, whether or not the periodic sweep has purged it yet.

use crate::clock::Clock;
use crate::errors::InputError;
use crate::ids::ControllerId;
use crate::persist::{load_table_or_empty, write_table};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default cadence of the expiry sweep (seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Longest grant a controller can be given, in days.
pub const MAX_GRANT_DAYS: u32 = 3650;

/// A controller's right to use gated operations until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementEntry {
    pub controller_id: ControllerId,
    pub expires_at: DateTime<Utc>,
}

/// How long a grant lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Expires this long after now.
    For(Duration),
    /// Expires at a fixed instant.
    Until(DateTime<Utc>),
}

impl Grant {
    /// A grant of `days` whole days, validated against [`MAX_GRANT_DAYS`].
    pub fn days(days: u32) -> Result<Self, InputError> {
        if days == 0 || days > MAX_GRANT_DAYS {
            return Err(InputError::new(
                "days",
                format!("expected 1-{} days, got {}", MAX_GRANT_DAYS, days),
            ));
        }
        Ok(Self::For(Duration::days(i64::from(days))))
    }
}

/// Entitlement table backed by a JSON file.
pub struct EntitlementRegistry {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<EntitlementEntry>>,
}

impl EntitlementRegistry {
    pub fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        let entries = load_table_or_empty(&path);
        Self {
            path,
            clock,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EntitlementEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff the controller holds an entry that expires after now.
    pub fn is_entitled(&self, controller: &ControllerId) -> bool {
        self.expires_at(controller).is_some()
    }

    /// Expiry of the controller's entitlement, if it is still live.
    pub fn expires_at(&self, controller: &ControllerId) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .find(|entry| &entry.controller_id == controller)
            .map(|entry| entry.expires_at)
            .filter(|expires_at| *expires_at > now)
    }

    /// Grants or replaces the controller's entitlement.
    ///
    /// Rejects a grant whose expiry would not be in the future.
    pub fn grant(
        &self,
        controller: ControllerId,
        grant: Grant,
    ) -> Result<DateTime<Utc>, InputError> {
        let now = self.clock.now();
        let expires_at = match grant {
            Grant::For(duration) => now
                .checked_add_signed(duration)
                .ok_or_else(|| InputError::new("duration", "out of range"))?,
            Grant::Until(at) => at,
        };
        if expires_at <= now {
            return Err(InputError::new("duration", "expiry must be in the future"));
        }

        let mut entries = self.lock();
        match entries
            .iter_mut()
            .find(|entry| entry.controller_id == controller)
        {
            Some(entry) => entry.expires_at = expires_at,
            None => entries.push(EntitlementEntry {
                controller_id: controller,
                expires_at,
            }),
        }
        self.flush(&entries);
        Ok(expires_at)
    }

    /// Removes the controller's entitlement. Returns whether one existed.
    pub fn revoke(&self, controller: &ControllerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| &entry.controller_id != controller);
        let removed = entries.len() != before;
        if removed {
            self.flush(&entries);
        }
        removed
    }

    /// Live entries with their remaining time, soonest expiry first.
    pub fn active(&self) -> Vec<(EntitlementEntry, Duration)> {
        let now = self.clock.now();
        let mut live: Vec<_> = self
            .lock()
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| (entry.clone(), entry.expires_at - now))
            .collect();
        live.sort_by_key(|(entry, _)| entry.expires_at);
        live
    }

    /// Purges expired entries, persisting only if something was removed.
    ///
    /// Returns the number of entries purged.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            self.flush(&entries);
            tracing::info!(purged, "expired entitlements cleaned");
        }
        purged
    }

    /// Runs [`sweep`](Self::sweep) once immediately and then every `interval`
    /// until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }

    fn flush(&self, entries: &[EntitlementEntry]) {
        if let Err(e) = write_table(&self.path, entries) {
            tracing::warn!(error = ?e, "failed to persist entitlement table");
        }
    }
}

#[cfg(test)]
#[path = "tests/entitlement_tests.rs"]
mod tests;
