//! Durable controller to tenant pairings.
//!
//! A controller holds at most one tenant at a time; pairing again overwrites.
//! Every mutation rewrites the whole table before returning, so a crash right
//! after a successful call never loses it. A failed write is logged and the
//! in-memory table stays authoritative until the next successful write.

use crate::ids::{ControllerId, TenantId};
use crate::persist::{load_table_or_empty, write_table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One controller's claim on a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    pub controller_id: ControllerId,
    pub tenant_id: TenantId,
}

/// In-memory pairing index backed by a JSON table.
pub struct PairingRegistry {
    path: PathBuf,
    entries: Mutex<Vec<PairingEntry>>,
}

impl PairingRegistry {
    /// Loads the table at `path`; an unreadable table starts empty.
    pub fn load(path: PathBuf) -> Self {
        let mut entries: Vec<PairingEntry> = load_table_or_empty(&path);

        // Older tables may hold several rows per controller; the last one wins.
        let mut seen = BTreeSet::new();
        entries.reverse();
        entries.retain(|entry| seen.insert(entry.controller_id.clone()));
        entries.reverse();

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PairingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the tenant paired with `controller`.
    pub fn get(&self, controller: &ControllerId) -> Option<TenantId> {
        self.lock()
            .iter()
            .find(|entry| &entry.controller_id == controller)
            .map(|entry| entry.tenant_id.clone())
    }

    /// Pairs `controller` with `tenant`, replacing any earlier tenant.
    pub fn set(&self, controller: ControllerId, tenant: TenantId) {
        let mut entries = self.lock();
        match entries
            .iter_mut()
            .find(|entry| entry.controller_id == controller)
        {
            Some(entry) if entry.tenant_id == tenant => return,
            Some(entry) => entry.tenant_id = tenant,
            None => entries.push(PairingEntry {
                controller_id: controller,
                tenant_id: tenant,
            }),
        }
        self.flush(&entries);
    }

    /// Drops the controller's pairing. Returns whether one existed.
    pub fn remove(&self, controller: &ControllerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| &entry.controller_id != controller);
        let removed = entries.len() != before;
        if removed {
            self.flush(&entries);
        }
        removed
    }

    /// Strips `tenant` from every controller that references it.
    ///
    /// Returns how many pairings were dropped; a second call is a no-op.
    pub fn remove_tenant(&self, tenant: &TenantId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| &entry.tenant_id != tenant);
        let removed = before - entries.len();
        if removed > 0 {
            self.flush(&entries);
        }
        removed
    }

    /// Every tenant that at least one controller is paired with.
    pub fn paired_tenants(&self) -> BTreeSet<TenantId> {
        self.lock()
            .iter()
            .map(|entry| entry.tenant_id.clone())
            .collect()
    }

    /// Controllers currently paired with `tenant`.
    pub fn controllers_of(&self, tenant: &TenantId) -> Vec<ControllerId> {
        self.lock()
            .iter()
            .filter(|entry| &entry.tenant_id == tenant)
            .map(|entry| entry.controller_id.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<PairingEntry> {
        self.lock().clone()
    }

    fn flush(&self, entries: &[PairingEntry]) {
        if let Err(e) = write_table(&self.path, entries) {
            tracing::warn!(error = ?e, "failed to persist pairing table");
        }
    }
}

#[cfg(test)]
#[path = "tests/pairing_tests.rs"]
mod tests;
