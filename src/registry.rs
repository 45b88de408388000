//! The shared context every component receives.
//!
//! Bundles the durable tables and the live session table so they are passed
//! around explicitly rather than living in globals. Two registries rooted in
//! different directories are fully independent.

use crate::active::ActiveTenants;
use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::entitlement::EntitlementRegistry;
use crate::ids::TenantId;
use crate::network::SessionHandle;
use crate::pairing::PairingRegistry;
use crate::paths::StoragePaths;
use crate::sessions::SessionTable;
use anyhow::Result;
use std::sync::Arc;

pub struct Registry {
    paths: StoragePaths,
    credentials: Arc<CredentialStore>,
    pairings: PairingRegistry,
    entitlements: Arc<EntitlementRegistry>,
    active: ActiveTenants,
    sessions: SessionTable,
}

impl Registry {
    /// Creates the storage directories and loads every durable table.
    pub fn open(paths: StoragePaths, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        paths.ensure()?;

        let registry = Self {
            credentials: Arc::new(CredentialStore::new(paths.clone())),
            pairings: PairingRegistry::load(paths.pairings_path()),
            entitlements: Arc::new(EntitlementRegistry::load(paths.entitlements_path(), clock)),
            active: ActiveTenants::load(paths.active_sessions_path()),
            sessions: SessionTable::new(),
            paths,
        };

        tracing::debug!(
            root = %registry.paths.root().display(),
            pairings = registry.pairings.entries().len(),
            previously_active = registry.active.list().len(),
            "registry opened"
        );
        Ok(Arc::new(registry))
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn pairings(&self) -> &PairingRegistry {
        &self.pairings
    }

    pub fn entitlements(&self) -> &Arc<EntitlementRegistry> {
        &self.entitlements
    }

    pub fn active(&self) -> &ActiveTenants {
        &self.active
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Splits the previously-active list into ghosts and intact tenants.
    ///
    /// A ghost is listed but has no usable credential directory.
    pub fn find_ghosts(&self) -> (Vec<TenantId>, Vec<TenantId>) {
        self.active
            .list()
            .into_iter()
            .partition(|tenant| !self.credentials.is_intact(tenant))
    }

    /// Removes every trace of `tenant`: credential directory, active entry,
    /// pairings and session handle.
    ///
    /// Returns the removed handle so the caller can close it. Repeating the
    /// call is harmless.
    pub(crate) async fn purge_tenant(&self, tenant: &TenantId) -> Option<Arc<dyn SessionHandle>> {
        if let Err(e) = self.credentials.delete(tenant).await {
            tracing::warn!(tenant = %tenant, error = ?e, "failed to delete credentials");
        }
        self.active.remove(tenant);
        let unpaired = self.pairings.remove_tenant(tenant);
        let handle = self.sessions.remove(tenant);

        tracing::info!(
            tenant = %tenant,
            unpaired,
            had_handle = handle.is_some(),
            "tenant purged"
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::credentials::CredentialState;
    use crate::ids::ControllerId;
    use crate::network::scripted::ScriptedHandle;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_purge_removes_tenant_everywhere() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(StoragePaths::new(dir.path()), Arc::new(SystemClock)).unwrap();
        let tenant = TenantId::from("1111111111");

        registry
            .credentials()
            .save(&tenant, &CredentialState(serde_json::json!({"k": 1})))
            .await
            .unwrap();
        registry.active().add(&tenant);
        registry.pairings().set(ControllerId::from("1"), tenant.clone());
        registry.pairings().set(ControllerId::from("2"), tenant.clone());
        registry
            .sessions()
            .put(tenant.clone(), Arc::new(ScriptedHandle::new()));

        assert!(registry.purge_tenant(&tenant).await.is_some());

        assert!(registry.credentials().load(&tenant).is_none());
        assert!(!registry.active().contains(&tenant));
        assert!(registry.pairings().controllers_of(&tenant).is_empty());
        assert!(registry.sessions().get(&tenant).is_none());

        // Second purge is a no-op.
        assert!(registry.purge_tenant(&tenant).await.is_none());
    }

    #[tokio::test]
    async fn test_find_ghosts() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(StoragePaths::new(dir.path()), Arc::new(SystemClock)).unwrap();
        let ghost = TenantId::from("111");
        let intact = TenantId::from("222");

        registry.active().add(&ghost);
        registry.active().add(&intact);
        registry.credentials().ensure_dir(&ghost).unwrap();
        registry
            .credentials()
            .save(&intact, &CredentialState(serde_json::json!({"k": 1})))
            .await
            .unwrap();

        let (ghosts, kept) = registry.find_ghosts();
        assert_eq!(ghosts, vec![ghost]);
        assert_eq!(kept, vec![intact]);
    }
}
