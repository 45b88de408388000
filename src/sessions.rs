//! In-memory table of live session handles.
//!
//! This is the only answer to "is this tenant connected right now". Reads are
//! open to everyone; mutation is crate-private and only the lifecycle manager
//! performs it. At most one handle exists per tenant.

use crate::ids::TenantId;
use crate::network::SessionHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use uuid::Uuid;

#[derive(Default)]
pub struct SessionTable {
    handles: RwLock<HashMap<TenantId, Arc<dyn SessionHandle>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TenantId, Arc<dyn SessionHandle>>> {
        self.handles.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TenantId, Arc<dyn SessionHandle>>> {
        self.handles.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<dyn SessionHandle>> {
        self.read().get(tenant).cloned()
    }

    /// Connected tenants, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<_> = self.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Installs `handle`, returning the one it replaced.
    ///
    /// The caller closes the returned handle.
    pub(crate) fn put(
        &self,
        tenant: TenantId,
        handle: Arc<dyn SessionHandle>,
    ) -> Option<Arc<dyn SessionHandle>> {
        self.write().insert(tenant, handle)
    }

    pub(crate) fn remove(&self, tenant: &TenantId) -> Option<Arc<dyn SessionHandle>> {
        self.write().remove(tenant)
    }

    /// Removes the tenant's handle only if it is still connection `id`.
    ///
    /// A task tearing down an old connection must not drop a newer handle
    /// installed by a re-pair.
    pub(crate) fn remove_if(&self, tenant: &TenantId, id: Uuid) -> Option<Arc<dyn SessionHandle>> {
        let mut handles = self.write();
        match handles.get(tenant) {
            Some(handle) if handle.connection_id() == id => handles.remove(tenant),
            _ => None,
        }
    }
}
