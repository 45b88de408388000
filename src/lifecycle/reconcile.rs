//! Ghost-session cleanup.
//!
//! A ghost is a tenant on the previously-active list whose credential
//! directory is missing, empty or lacks a credential record. Ghosts are
//! evicted without attempting a connection. When anything was removed the
//! caller is expected to restart the whole process so in-memory state is
//! rebuilt from the cleaned tables.

use super::LifecycleManager;
use crate::ids::TenantId;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};

/// What a reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub removed: Vec<TenantId>,
    pub kept: Vec<TenantId>,
    pub restart_required: bool,
}

impl ReconcileReport {
    fn new(removed: Vec<TenantId>, kept: Vec<TenantId>) -> Self {
        let restart_required = !removed.is_empty();
        Self {
            removed,
            kept,
            restart_required,
        }
    }
}

impl LifecycleManager {
    /// Evicts every ghost, stopping any task still serving it.
    pub async fn reconcile(&self) -> ReconcileReport {
        let (ghosts, kept) = self.registry().find_ghosts();
        for ghost in &ghosts {
            tracing::info!(tenant = %ghost, "removing ghost session");
            self.evict(ghost).await;
        }
        finish(self.registry(), ghosts, kept)
    }
}

/// Reconciles the durable tables without a running lifecycle manager.
pub async fn reconcile_offline(registry: &Registry) -> ReconcileReport {
    let (ghosts, kept) = registry.find_ghosts();
    for ghost in &ghosts {
        tracing::info!(tenant = %ghost, "removing ghost session");
        if let Some(handle) = registry.purge_tenant(ghost).await {
            handle.close().await;
        }
    }
    finish(registry, ghosts, kept)
}

fn finish(registry: &Registry, removed: Vec<TenantId>, kept: Vec<TenantId>) -> ReconcileReport {
    // No survivors means no list file at all.
    if kept.is_empty() {
        registry.active().replace(&[]);
    }
    let report = ReconcileReport::new(removed, kept);
    tracing::info!(
        removed = report.removed.len(),
        kept = report.kept.len(),
        restart_required = report.restart_required,
        "reconciliation finished"
    );
    report
}
