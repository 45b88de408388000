//! Command surface controllers use to drive the session manager.
//!
//! Every command is authorized against the entitlement registry and the
//! configured owner before anything else happens. Failures reach the
//! controller as a short reply; the details only go to the log.

mod notice;

pub use notice::{format_pairing_code, ControlNotifier, Notice};

use crate::entitlement::Grant;
use crate::errors::ControlError;
use crate::ids::{ControllerId, TenantId};
use crate::lifecycle::machine::SessionState;
use crate::lifecycle::reconcile::ReconcileReport;
use crate::lifecycle::LifecycleManager;
use crate::network::SessionOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// A command as it arrives from the control channel, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    RequestPairing {
        tenant: String,
    },
    DeletePairing {
        tenant: String,
    },
    Status,
    ListTenants,
    ListEntitlements,
    Grant {
        controller: String,
        days: u32,
    },
    Revoke {
        controller: String,
    },
    Reconcile,
    Operation {
        op: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl ControlCommand {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RequestPairing { .. } => "request_pairing",
            Self::DeletePairing { .. } => "delete_pairing",
            Self::Status => "status",
            Self::ListTenants => "list_tenants",
            Self::ListEntitlements => "list_entitlements",
            Self::Grant { .. } => "grant",
            Self::Revoke { .. } => "revoke",
            Self::Reconcile => "reconcile",
            Self::Operation { .. } => "operation",
        }
    }

    fn access(&self) -> Access {
        match self {
            Self::RequestPairing { .. }
            | Self::DeletePairing { .. }
            | Self::Status
            | Self::Operation { .. } => Access::Entitled,
            Self::Reconcile => Access::EntitledAndPaired,
            Self::ListTenants | Self::ListEntitlements | Self::Grant { .. } | Self::Revoke { .. } => {
                Access::Owner
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Entitled,
    EntitledAndPaired,
    Owner,
}

/// One row of the tenant listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSummary {
    pub tenant: TenantId,
    pub state: Option<SessionState>,
    pub connected: bool,
    pub controllers: Vec<ControllerId>,
}

/// One row of the entitlement listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementSummary {
    pub controller: ControllerId,
    pub expires_at: DateTime<Utc>,
    pub remaining_secs: i64,
}

/// The answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    PairingStarted {
        tenant: TenantId,
    },
    PairingDeleted {
        tenant: TenantId,
    },
    Status {
        owner: bool,
        tenant: Option<TenantId>,
        state: Option<SessionState>,
        connected: bool,
        entitled_until: Option<DateTime<Utc>>,
    },
    Tenants {
        tenants: Vec<TenantSummary>,
    },
    Entitlements {
        entitlements: Vec<EntitlementSummary>,
    },
    Granted {
        controller: ControllerId,
        expires_at: DateTime<Utc>,
    },
    Revoked {
        controller: ControllerId,
        existed: bool,
    },
    Reconciled(ReconcileReport),
    OperationResult {
        result: serde_json::Value,
    },
    NotPaired,
    NotConnected,
    Denied,
    InvalidInput {
        field: String,
        message: String,
    },
    Failed {
        message: String,
    },
}

/// Translates controller commands into lifecycle and registry calls.
pub struct ControlSurface {
    manager: Arc<LifecycleManager>,
    notifier: Arc<dyn ControlNotifier>,
    owner: Option<ControllerId>,
    /// One outbound operation at a time per tenant, whatever the binding.
    operation_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ControlSurface {
    pub fn new(
        manager: Arc<LifecycleManager>,
        notifier: Arc<dyn ControlNotifier>,
        owner: Option<ControllerId>,
    ) -> Self {
        Self {
            manager,
            notifier,
            owner,
            operation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    fn is_owner(&self, controller: &ControllerId) -> bool {
        self.owner.as_ref() == Some(controller)
    }

    fn authorize(&self, controller: &ControllerId, access: Access) -> Result<(), ControlError> {
        if self.is_owner(controller) {
            return Ok(());
        }
        let registry = self.manager.registry();
        let allowed = match access {
            Access::Owner => false,
            Access::Entitled => registry.entitlements().is_entitled(controller),
            Access::EntitledAndPaired => {
                registry.entitlements().is_entitled(controller)
                    && registry.pairings().get(controller).is_some()
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(ControlError::Denied)
        }
    }

    /// Runs one command and turns every outcome into a reply.
    pub async fn handle(&self, controller: &ControllerId, command: ControlCommand) -> ControlReply {
        let label = command.label();
        match self.dispatch(controller, command).await {
            Ok(reply) => reply,
            Err(ControlError::Denied) => {
                tracing::info!(controller = %controller, command = label, "command denied");
                self.notifier
                    .notify(
                        controller,
                        Notice::EntitlementDenied {
                            command: label.to_string(),
                        },
                    )
                    .await;
                ControlReply::Denied
            }
            Err(ControlError::InvalidInput(e)) => ControlReply::InvalidInput {
                field: e.field.to_string(),
                message: e.message,
            },
            Err(ControlError::NotPaired) => ControlReply::NotPaired,
            Err(ControlError::NotConnected) => ControlReply::NotConnected,
            Err(ControlError::Operation(e)) => {
                tracing::warn!(controller = %controller, error = %e, "session operation failed");
                ControlReply::Failed {
                    message: "operation failed".to_string(),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        controller: &ControllerId,
        command: ControlCommand,
    ) -> Result<ControlReply, ControlError> {
        self.authorize(controller, command.access())?;
        let registry = self.manager.registry();

        match command {
            ControlCommand::RequestPairing { tenant } => {
                let tenant = TenantId::parse(&tenant)?;
                self.on_pairing_requested(controller, tenant.clone()).await?;
                Ok(ControlReply::PairingStarted { tenant })
            }
            ControlCommand::DeletePairing { tenant } => {
                let tenant = TenantId::parse(&tenant)?;
                let paired = registry.pairings().get(controller).as_ref() == Some(&tenant);
                if !paired && !self.is_owner(controller) {
                    return Err(ControlError::NotPaired);
                }
                self.manager.evict(&tenant).await;
                Ok(ControlReply::PairingDeleted { tenant })
            }
            ControlCommand::Status => {
                let tenant = registry.pairings().get(controller);
                let state = tenant.as_ref().and_then(|t| self.manager.state(t));
                let connected = tenant
                    .as_ref()
                    .is_some_and(|t| registry.sessions().get(t).is_some());
                Ok(ControlReply::Status {
                    owner: self.is_owner(controller),
                    tenant,
                    state,
                    connected,
                    entitled_until: registry.entitlements().expires_at(controller),
                })
            }
            ControlCommand::ListTenants => {
                let mut tenants: BTreeSet<TenantId> = registry.active().list().into_iter().collect();
                tenants.extend(registry.sessions().tenants());
                let tenants = tenants
                    .into_iter()
                    .map(|tenant| TenantSummary {
                        state: self.manager.state(&tenant),
                        connected: registry.sessions().get(&tenant).is_some(),
                        controllers: registry.pairings().controllers_of(&tenant),
                        tenant,
                    })
                    .collect();
                Ok(ControlReply::Tenants { tenants })
            }
            ControlCommand::ListEntitlements => {
                let entitlements = registry
                    .entitlements()
                    .active()
                    .into_iter()
                    .map(|(entry, remaining)| EntitlementSummary {
                        controller: entry.controller_id,
                        expires_at: entry.expires_at,
                        remaining_secs: remaining.num_seconds(),
                    })
                    .collect();
                Ok(ControlReply::Entitlements { entitlements })
            }
            ControlCommand::Grant {
                controller: grantee,
                days,
            } => {
                let grantee = ControllerId::parse(&grantee)?;
                let grant = Grant::days(days)?;
                let expires_at = registry.entitlements().grant(grantee.clone(), grant)?;
                tracing::info!(controller = %grantee, %expires_at, "entitlement granted");
                self.notifier
                    .notify(&grantee, Notice::EntitlementGranted { expires_at })
                    .await;
                Ok(ControlReply::Granted {
                    controller: grantee,
                    expires_at,
                })
            }
            ControlCommand::Revoke {
                controller: grantee,
            } => {
                let grantee = ControllerId::parse(&grantee)?;
                let existed = registry.entitlements().revoke(&grantee);
                Ok(ControlReply::Revoked {
                    controller: grantee,
                    existed,
                })
            }
            ControlCommand::Reconcile => {
                let report = self.manager.reconcile().await;
                Ok(ControlReply::Reconciled(report))
            }
            ControlCommand::Operation { op, args } => {
                let result = self
                    .on_session_operation(controller, SessionOperation { op, args })
                    .await?;
                Ok(ControlReply::OperationResult { result })
            }
        }
    }

    /// Starts a fresh pairing of `tenant` on behalf of `controller`.
    pub async fn on_pairing_requested(
        &self,
        controller: &ControllerId,
        tenant: TenantId,
    ) -> Result<(), ControlError> {
        self.authorize(controller, Access::Entitled)?;
        tracing::info!(controller = %controller, tenant = %tenant, "pairing requested");
        self.manager.request_pairing(controller.clone(), tenant).await;
        Ok(())
    }

    /// Forwards an operation to the controller's paired tenant.
    pub async fn on_session_operation(
        &self,
        controller: &ControllerId,
        operation: SessionOperation,
    ) -> Result<serde_json::Value, ControlError> {
        self.authorize(controller, Access::Entitled)?;
        let registry = self.manager.registry();
        let tenant = registry
            .pairings()
            .get(controller)
            .ok_or(ControlError::NotConnected)?;

        let lock = self.operation_lock(&tenant);
        let _guard = lock.lock().await;
        // Looked up under the lock so a reconnect in between is picked up.
        let handle = registry
            .sessions()
            .get(&tenant)
            .ok_or(ControlError::NotConnected)?;
        tracing::debug!(tenant = %tenant, op = %operation.op, "forwarding operation");
        Ok(handle.execute(operation).await?)
    }

    fn operation_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .operation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
#[path = "tests/control_tests.rs"]
mod tests;
