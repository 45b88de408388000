//! The durable "previously active" tenant list.
//!
//! Tenants land here when they first reach `Connected` and leave when they are
//! evicted. At process start every listed tenant is restored from its stored
//! credentials. The file is read once; afterwards the in-memory list is the
//! source of truth and every change rewrites the whole file. An empty list
//! removes the file.

use crate::ids::TenantId;
use crate::persist::{load_table_or_empty, remove_table, write_table};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub struct ActiveTenants {
    path: PathBuf,
    tenants: Mutex<Vec<TenantId>>,
}

impl ActiveTenants {
    /// Loads the list at `path`, dropping duplicates.
    pub fn load(path: PathBuf) -> Self {
        let mut tenants: Vec<TenantId> = load_table_or_empty(&path);
        let mut seen = HashSet::new();
        tenants.retain(|t| seen.insert(t.clone()));
        Self {
            path,
            tenants: Mutex::new(tenants),
        }
    }

    /// Listed tenants in insertion order.
    pub fn list(&self) -> Vec<TenantId> {
        self.tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tenant)
    }

    /// Appends `tenant` unless already listed.
    pub fn add(&self, tenant: &TenantId) {
        let mut tenants = self.tenants.lock().unwrap_or_else(PoisonError::into_inner);
        if tenants.contains(tenant) {
            return;
        }
        tenants.push(tenant.clone());
        self.flush(&tenants);
    }

    /// Drops `tenant`. Returns whether it was listed.
    pub fn remove(&self, tenant: &TenantId) -> bool {
        let mut tenants = self.tenants.lock().unwrap_or_else(PoisonError::into_inner);
        let before = tenants.len();
        tenants.retain(|t| t != tenant);
        if tenants.len() == before {
            return false;
        }
        self.flush(&tenants);
        true
    }

    /// Replaces the whole list.
    pub fn replace(&self, replacement: &[TenantId]) {
        let mut tenants = self.tenants.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        *tenants = replacement
            .iter()
            .filter(|t| seen.insert((*t).clone()))
            .cloned()
            .collect();
        self.flush(&tenants);
    }

    // Called with the list locked so writes land in mutation order. A failed
    // write keeps the in-memory change; the next successful flush catches up.
    fn flush(&self, tenants: &[TenantId]) {
        let result = if tenants.is_empty() {
            remove_table(&self.path)
        } else {
            write_table(&self.path, tenants)
        };
        if let Err(e) = result {
            tracing::warn!(error = ?e, "failed to persist active tenant list");
        }
    }
}
