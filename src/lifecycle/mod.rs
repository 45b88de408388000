//! Per-tenant connection lifecycle.
//!
//! Every tenant being served runs one task that connects, feeds each
//! connection update through [`machine::decide`], and carries out the result.
//! Transient closes loop back to a fresh connect after a fixed backoff; fatal
//! closes evict the tenant and end the task.
//!
//! The lifecycle manager is the only writer of the session table.

pub mod machine;
pub mod reconcile;

use crate::control::{format_pairing_code, ControlNotifier, Notice};
use crate::credentials::CredentialQueue;
use crate::ids::{ControllerId, TenantId};
use crate::network::{
    Connection, ConnectionUpdate, NetworkBinding, SessionHandle, STATUS_TRANSPORT_LOST,
};
use crate::registry::Registry;
use machine::{decide, ClosePolicy, DecideContext, Decision, EvictReason, SessionState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

/// Timing and policy knobs for tenant tasks.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Fixed delay between a transient close and the next connect.
    pub reconnect_backoff: Duration,
    /// Consecutive failed reconnects before a tenant goes dormant.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Delay between the handshake starting and asking for a pairing code.
    pub pairing_code_delay: Duration,
    pub policy: ClosePolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(4),
            max_reconnect_attempts: None,
            pairing_code_delay: Duration::from_secs(1),
            policy: ClosePolicy::default(),
        }
    }
}

/// A state change for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub tenant: TenantId,
    pub from: Option<SessionState>,
    pub to: SessionState,
}

struct TenantTask {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// How one connection ended.
enum Outcome {
    Cancelled,
    Reconnect { status: u16, was_connected: bool },
    Evict(EvictReason),
}

pub struct LifecycleManager {
    registry: Arc<Registry>,
    binding: Arc<dyn NetworkBinding>,
    notifier: Arc<dyn ControlNotifier>,
    config: LifecycleConfig,
    states: Mutex<HashMap<TenantId, SessionState>>,
    tasks: Mutex<HashMap<TenantId, TenantTask>>,
    events: broadcast::Sender<LifecycleEvent>,
    start_lock: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        binding: Arc<dyn NetworkBinding>,
        notifier: Arc<dyn ControlNotifier>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            registry,
            binding,
            notifier,
            config,
            states: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            events,
            start_lock: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Subscribes to every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn state(&self, tenant: &TenantId) -> Option<SessionState> {
        self.states().get(tenant).copied()
    }

    /// Whether a task is currently serving `tenant`.
    pub fn is_running(&self, tenant: &TenantId) -> bool {
        self.tasks().contains_key(tenant)
    }

    fn states(&self) -> MutexGuard<'_, HashMap<TenantId, SessionState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TenantId, TenantTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a fresh pairing of `tenant` for `controller`.
    pub async fn request_pairing(self: &Arc<Self>, controller: ControllerId, tenant: TenantId) {
        self.start(tenant, Some(controller)).await;
    }

    /// Restarts every previously-active tenant. Returns how many were started.
    pub async fn restore_all(self: &Arc<Self>) -> usize {
        let tenants = self.registry.active().list();
        for tenant in &tenants {
            self.start(tenant.clone(), None).await;
        }
        tracing::info!(count = tenants.len(), "restored previously active tenants");
        tenants.len()
    }

    /// Launches a new task for `tenant`, replacing any running one.
    ///
    /// The old task is stopped and its handle closed before the new task
    /// starts, so two connections for one tenant never coexist.
    pub async fn start(self: &Arc<Self>, tenant: TenantId, controller: Option<ControllerId>) {
        let _serial = self.start_lock.lock().await;

        self.stop_task(&tenant).await;
        if let Some(old) = self.registry.sessions().remove(&tenant) {
            old.close().await;
        }

        self.transition(&tenant, SessionState::Initializing);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();

        let mut tasks = self.tasks();
        let join = tokio::spawn(self.clone().run_tenant(
            tenant.clone(),
            controller,
            cancel.clone(),
            generation,
        ));
        tasks.insert(
            tenant,
            TenantTask {
                generation,
                cancel,
                join,
            },
        );
    }

    /// Stops `tenant`'s task without touching its durable state.
    pub async fn cancel(&self, tenant: &TenantId) {
        let _serial = self.start_lock.lock().await;
        self.stop_task(tenant).await;
        if let Some(handle) = self.registry.sessions().remove(tenant) {
            handle.close().await;
        }
        self.states().remove(tenant);
    }

    /// Permanently removes `tenant`: stops its task, deletes its credentials,
    /// and drops it from the active list, every pairing and the session table.
    pub async fn evict(&self, tenant: &TenantId) {
        let _serial = self.start_lock.lock().await;
        self.stop_task(tenant).await;
        if let Some(handle) = self.registry.purge_tenant(tenant).await {
            handle.close().await;
        }
        self.mark_evicted(tenant);
    }

    /// Cancels every task and closes every handle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<TenantTask> = self.tasks().drain().map(|(_, task)| task).collect();
        for task in tasks {
            let _ = task.join.await;
        }
        for tenant in self.registry.sessions().tenants() {
            if let Some(handle) = self.registry.sessions().remove(&tenant) {
                handle.close().await;
            }
        }
        tracing::info!("lifecycle manager stopped");
    }

    async fn stop_task(&self, tenant: &TenantId) {
        let task = self.tasks().remove(tenant);
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.join.await {
                if e.is_panic() {
                    tracing::error!(tenant = %tenant, "tenant task panicked");
                }
            }
        }
    }

    fn finish_task(&self, tenant: &TenantId, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(tenant).is_some_and(|task| task.generation == generation) {
            tasks.remove(tenant);
        }
    }

    fn transition(&self, tenant: &TenantId, to: SessionState) {
        let from = self.states().insert(tenant.clone(), to);
        if from == Some(to) {
            return;
        }
        tracing::info!(
            tenant = %tenant,
            from = from.map(SessionState::label).unwrap_or("none"),
            to = to.label(),
            "state changed"
        );
        let _ = self.events.send(LifecycleEvent {
            tenant: tenant.clone(),
            from,
            to,
        });
    }

    /// Announces `Evicted`, then forgets the tenant.
    fn mark_evicted(&self, tenant: &TenantId) {
        self.transition(tenant, SessionState::Evicted);
        let mut states = self.states();
        if states.get(tenant) == Some(&SessionState::Evicted) {
            states.remove(tenant);
        }
    }

    /// Controllers that should hear about `tenant`: the one that asked, or
    /// else everyone paired with it.
    fn recipients(&self, tenant: &TenantId, controller: Option<&ControllerId>) -> Vec<ControllerId> {
        match controller {
            Some(controller) => vec![controller.clone()],
            None => self.registry.pairings().controllers_of(tenant),
        }
    }

    async fn notify_all(&self, recipients: &[ControllerId], notice: Notice) {
        for controller in recipients {
            self.notifier.notify(controller, notice.clone()).await;
        }
    }

    async fn run_tenant(
        self: Arc<Self>,
        tenant: TenantId,
        controller: Option<ControllerId>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let mut attempts: u32 = 0;

        loop {
            self.transition(&tenant, SessionState::Initializing);
            match self.run_connection(&tenant, controller.as_ref(), &cancel).await {
                Outcome::Cancelled => break,
                Outcome::Reconnect {
                    status,
                    was_connected,
                } => {
                    self.transition(&tenant, SessionState::ClosedTransient);
                    if was_connected {
                        attempts = 0;
                    }
                    attempts = attempts.saturating_add(1);
                    let recipients = self.recipients(&tenant, controller.as_ref());

                    if let Some(max) = self.config.max_reconnect_attempts {
                        if attempts > max {
                            tracing::warn!(
                                tenant = %tenant,
                                attempts = max,
                                "reconnect attempts exhausted, tenant dormant"
                            );
                            self.notify_all(
                                &recipients,
                                Notice::Dormant {
                                    tenant: tenant.clone(),
                                    attempts: max,
                                },
                            )
                            .await;
                            break;
                        }
                    }

                    tracing::info!(
                        tenant = %tenant,
                        status,
                        attempt = attempts,
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "reconnecting"
                    );
                    self.notify_all(
                        &recipients,
                        Notice::Reconnecting {
                            tenant: tenant.clone(),
                            status,
                            attempt: attempts,
                        },
                    )
                    .await;

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                    }
                }
                Outcome::Evict(reason) => {
                    let recipients = self.recipients(&tenant, controller.as_ref());
                    tracing::warn!(tenant = %tenant, reason = %reason, "evicting tenant");
                    if let Some(handle) = self.registry.purge_tenant(&tenant).await {
                        handle.close().await;
                    }
                    self.mark_evicted(&tenant);
                    self.notify_all(
                        &recipients,
                        Notice::PairingFailed {
                            tenant: tenant.clone(),
                            reason: reason.to_string(),
                        },
                    )
                    .await;
                    break;
                }
            }
        }

        self.finish_task(&tenant, generation);
    }

    async fn run_connection(
        self: &Arc<Self>,
        tenant: &TenantId,
        controller: Option<&ControllerId>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let transient = |was_connected| Outcome::Reconnect {
            status: STATUS_TRANSPORT_LOST,
            was_connected,
        };

        let credentials = self.registry.credentials();
        let dir = match credentials.ensure_dir(tenant) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = ?e, "credential directory unavailable");
                return transient(false);
            }
        };
        let stored = credentials.load(tenant);
        tracing::debug!(tenant = %tenant, resuming = stored.is_some(), "connecting");

        let connected = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = self.binding.connect(tenant, stored, &dir) => result,
        };
        let Connection {
            handle,
            mut updates,
        } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "connect failed");
                return transient(false);
            }
        };

        let queue = CredentialQueue::spawn(tenant.clone(), credentials.clone());
        let mut pair_code_task: Option<JoinHandle<()>> = None;
        let mut was_connected = false;

        let outcome = loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break Outcome::Cancelled,
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                break transient(was_connected);
            };

            let state = self.state(tenant).unwrap_or(SessionState::Initializing);
            let context = DecideContext {
                credentials_present: credentials.has_credentials(tenant),
            };
            let decision = decide(state, &update, context, &self.config.policy);
            tracing::debug!(tenant = %tenant, state = state.label(), ?decision, "connection update");

            match decision {
                Decision::RequestPairCode => {
                    self.transition(tenant, SessionState::AwaitingPairCode);
                    if let Some(previous) = pair_code_task.take() {
                        previous.abort();
                    }
                    pair_code_task = Some(self.spawn_pair_code_request(
                        tenant.clone(),
                        controller.cloned(),
                        handle.clone(),
                    ));
                }
                Decision::Register => {
                    self.register(tenant, controller, handle.clone()).await;
                    was_connected = true;
                }
                Decision::PersistCredentials => {
                    if let ConnectionUpdate::CredentialsUpdated(state) = update {
                        queue.enqueue(state);
                    }
                }
                Decision::Reconnect { status } => {
                    self.transition(tenant, SessionState::ClosedTransient);
                    break Outcome::Reconnect {
                        status,
                        was_connected,
                    };
                }
                Decision::Evict(reason) => {
                    self.transition(tenant, SessionState::ClosedFatal);
                    break Outcome::Evict(reason);
                }
                Decision::Ignore => {}
            }
        };

        if let Some(task) = pair_code_task {
            task.abort();
        }
        self.registry
            .sessions()
            .remove_if(tenant, handle.connection_id());
        handle.close().await;
        queue.close().await;
        outcome
    }

    /// Installs the handle and records the tenant as active and paired.
    async fn register(
        &self,
        tenant: &TenantId,
        controller: Option<&ControllerId>,
        handle: Arc<dyn SessionHandle>,
    ) {
        let sessions = self.registry.sessions();
        if let Some(old) = sessions.remove(tenant) {
            if old.connection_id() != handle.connection_id() {
                old.close().await;
            }
        }
        sessions.put(tenant.clone(), handle);

        self.registry.active().add(tenant);
        if let Some(controller) = controller {
            self.registry.pairings().set(controller.clone(), tenant.clone());
        }
        self.transition(tenant, SessionState::Connected);

        let recipients = self.recipients(tenant, controller);
        self.notify_all(
            &recipients,
            Notice::Connected {
                tenant: tenant.clone(),
            },
        )
        .await;
    }

    /// Asks for a pairing code after the configured delay, unless credentials
    /// showed up in the meantime or the handshake moved on.
    fn spawn_pair_code_request(
        self: &Arc<Self>,
        tenant: TenantId,
        controller: Option<ControllerId>,
        handle: Arc<dyn SessionHandle>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.pairing_code_delay).await;

            if manager.registry.credentials().has_credentials(&tenant) {
                tracing::debug!(tenant = %tenant, "credentials present, skipping pairing code");
                return;
            }
            if manager.state(&tenant) != Some(SessionState::AwaitingPairCode) {
                return;
            }

            let recipients = manager.recipients(&tenant, controller.as_ref());
            match handle.request_pairing_code().await {
                Ok(code) => {
                    tracing::info!(tenant = %tenant, "pairing code issued");
                    manager
                        .notify_all(
                            &recipients,
                            Notice::PairingCode {
                                tenant: tenant.clone(),
                                code: format_pairing_code(&code),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %e, "pairing code request failed");
                    manager
                        .notify_all(&recipients, Notice::PairingCodeFailed { tenant })
                        .await;
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
