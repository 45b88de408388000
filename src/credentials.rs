//! Per-tenant credential storage.
//!
//! Each tenant owns one directory under the sessions root. The network binding
//! may keep whatever it likes in there; this module owns `creds.json`, the
//! record that decides whether a tenant can reconnect without pairing again.
//!
//! Writes for one tenant are strictly ordered. Credential updates arrive from
//! the network faster than the disk absorbs them, so the lifecycle manager
//! feeds them through a [`CredentialQueue`] rather than awaiting each write.

use crate::ids::TenantId;
use crate::paths::StoragePaths;
use crate::persist::sibling_with_suffix;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Name of the credential record inside a tenant directory.
pub const CREDENTIALS_FILE: &str = "creds.json";

/// Opaque authentication state handed out by the network layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialState(pub serde_json::Value);

/// Something that can durably record a tenant's credentials.
#[async_trait]
pub trait CredentialPersist: Send + Sync {
    async fn persist(&self, tenant: &TenantId, state: &CredentialState) -> Result<()>;
}

/// Filesystem-backed credential store.
pub struct CredentialStore {
    paths: StoragePaths,
    write_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the tenant's credential directory (not created).
    pub fn dir(&self, tenant: &TenantId) -> PathBuf {
        self.paths.credential_dir(tenant)
    }

    /// Returns the tenant's credential directory, creating it on first use.
    pub fn ensure_dir(&self, tenant: &TenantId) -> Result<PathBuf> {
        let dir = self.dir(tenant);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create credential directory: {}", dir.display()))?;
        Ok(dir)
    }

    fn record_path(&self, tenant: &TenantId) -> PathBuf {
        self.dir(tenant).join(CREDENTIALS_FILE)
    }

    /// Loads the tenant's credential record.
    ///
    /// A missing, unreadable or corrupt record is reported as `None` so the
    /// caller falls back to a fresh pairing.
    pub fn load(&self, tenant: &TenantId) -> Option<CredentialState> {
        let path = self.record_path(tenant);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "credential record unreadable");
                return None;
            }
        };

        match serde_json::from_str::<CredentialState>(&content) {
            Ok(state) if !state.0.is_null() => Some(state),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "credential record corrupt");
                None
            }
        }
    }

    /// True when a credential record file exists for the tenant.
    pub fn has_credentials(&self, tenant: &TenantId) -> bool {
        self.record_path(tenant).is_file()
    }

    /// True when the tenant directory exists, holds a credential record and
    /// is not empty. Anything else is a ghost session.
    pub fn is_intact(&self, tenant: &TenantId) -> bool {
        let dir = self.dir(tenant);
        if !dir.is_dir() || !self.has_credentials(tenant) {
            return false;
        }
        std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Writes the tenant's credential record, replacing the previous one.
    ///
    /// Saves for the same tenant never overlap; saves for different tenants
    /// run concurrently.
    pub async fn save(&self, tenant: &TenantId, state: &CredentialState) -> Result<()> {
        let lock = self.write_lock(tenant);
        let _guard = lock.lock().await;

        let dir = self.ensure_dir(tenant)?;
        let path = dir.join(CREDENTIALS_FILE);
        let temp_path = sibling_with_suffix(&path, ".tmp");
        let content =
            serde_json::to_vec_pretty(state).context("Failed to serialize credential record")?;

        tokio::fs::write(&temp_path, &content)
            .await
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
        Ok(())
    }

    /// Removes the tenant's whole credential directory.
    pub async fn delete(&self, tenant: &TenantId) -> Result<()> {
        let lock = self.write_lock(tenant);
        let _guard = lock.lock().await;

        let dir = self.dir(tenant);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove credential directory: {}", dir.display())
                })
            }
        }
        Ok(())
    }

    fn write_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CredentialPersist for CredentialStore {
    async fn persist(&self, tenant: &TenantId, state: &CredentialState) -> Result<()> {
        self.save(tenant, state).await
    }
}

enum QueueItem {
    Write(CredentialState),
    Flush(oneshot::Sender<()>),
}

/// Serialized, non-blocking writer for one tenant's credential updates.
///
/// Writes land in enqueue order. A failed write is logged and the queue moves
/// on, so one bad write never stalls the updates behind it.
pub struct CredentialQueue {
    tenant: TenantId,
    tx: mpsc::UnboundedSender<QueueItem>,
    task: JoinHandle<()>,
}

impl CredentialQueue {
    pub fn spawn(tenant: TenantId, sink: Arc<dyn CredentialPersist>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
        let writer_tenant = tenant.clone();

        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    QueueItem::Write(state) => {
                        if let Err(e) = sink.persist(&writer_tenant, &state).await {
                            tracing::warn!(
                                tenant = %writer_tenant,
                                error = ?e,
                                "credential write failed, continuing with next update"
                            );
                        }
                    }
                    QueueItem::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tenant, tx, task }
    }

    /// Queues a write and returns immediately.
    pub fn enqueue(&self, state: CredentialState) {
        if self.tx.send(QueueItem::Write(state)).is_err() {
            tracing::warn!(tenant = %self.tenant, "credential queue closed, update dropped");
        }
    }

    /// Waits until every write queued so far has completed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drains the remaining writes and stops the writer task.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
