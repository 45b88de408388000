use super::*;
use crate::clock::ManualClock;
use crate::credentials::CredentialState;
use crate::lifecycle::LifecycleConfig;
use crate::network::scripted::{ScriptedBinding, ScriptedConnection, ScriptedConnections};
use crate::network::ConnectionUpdate;
use crate::paths::StoragePaths;
use crate::registry::Registry;
use crate::test_support::{eventually, RecordingNotifier};
use chrono::TimeZone;
use serde_json::json;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const OWNER: &str = "100";

struct Harness {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    connections: ScriptedConnections,
    notifier: Arc<RecordingNotifier>,
    surface: ControlSurface,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    let registry = Registry::open(StoragePaths::new(dir.path()), clock.clone()).unwrap();
    let (binding, connections) = ScriptedBinding::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let config = LifecycleConfig {
        reconnect_backoff: Duration::from_millis(10),
        pairing_code_delay: Duration::from_millis(10),
        ..LifecycleConfig::default()
    };
    let manager = LifecycleManager::new(registry, binding, notifier.clone(), config);
    let surface = ControlSurface::new(manager, notifier.clone(), Some(ControllerId::from(OWNER)));
    Harness {
        _dir: dir,
        clock,
        connections,
        notifier,
        surface,
    }
}

fn owner() -> ControllerId {
    ControllerId::from(OWNER)
}

fn grant(h: &Harness, controller: &ControllerId, days: u32) {
    h.surface
        .manager()
        .registry()
        .entitlements()
        .grant(controller.clone(), Grant::days(days).unwrap())
        .unwrap();
}

/// Pairs `tenant` for `controller` and brings it to `Connected`.
async fn pair(h: &mut Harness, controller: &ControllerId, tenant: &str) -> ScriptedConnection {
    let reply = h
        .surface
        .handle(
            controller,
            ControlCommand::RequestPairing {
                tenant: tenant.to_string(),
            },
        )
        .await;
    assert!(matches!(reply, ControlReply::PairingStarted { .. }));
    let conn = h.connections.next().await;
    conn.send(ConnectionUpdate::Open { transport_open: true }).await;
    let manager = h.surface.manager().clone();
    let tenant = TenantId::from(tenant);
    eventually("connected", || {
        manager.state(&tenant) == Some(SessionState::Connected)
    })
    .await;
    conn
}

#[tokio::test]
async fn test_unentitled_controller_is_denied_and_notified() {
    let h = harness();
    let stranger = ControllerId::from("5");

    let reply = h
        .surface
        .handle(
            &stranger,
            ControlCommand::RequestPairing {
                tenant: "1111111111".to_string(),
            },
        )
        .await;

    assert_eq!(reply, ControlReply::Denied);
    assert_eq!(
        h.notifier.notices(),
        vec![(
            stranger,
            Notice::EntitlementDenied {
                command: "request_pairing".to_string()
            }
        )]
    );
    assert!(!h
        .surface
        .manager()
        .is_running(&TenantId::from("1111111111")));
}

#[tokio::test]
async fn test_entitlement_expiry_is_checked_on_every_command() {
    let h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);

    assert!(matches!(
        h.surface.handle(&user, ControlCommand::Status).await,
        ControlReply::Status { .. }
    ));

    h.clock.advance(chrono::Duration::days(1));
    assert_eq!(
        h.surface.handle(&user, ControlCommand::Status).await,
        ControlReply::Denied
    );
}

#[tokio::test]
async fn test_owner_only_commands() {
    let h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 30);

    for command in [
        ControlCommand::ListTenants,
        ControlCommand::ListEntitlements,
        ControlCommand::Grant {
            controller: "6".to_string(),
            days: 1,
        },
        ControlCommand::Revoke {
            controller: "5".to_string(),
        },
    ] {
        assert_eq!(h.surface.handle(&user, command).await, ControlReply::Denied);
    }

    let reply = h.surface.handle(&owner(), ControlCommand::ListEntitlements).await;
    match reply {
        ControlReply::Entitlements { entitlements } => {
            assert_eq!(entitlements.len(), 1);
            assert_eq!(entitlements[0].controller, user);
            assert_eq!(entitlements[0].remaining_secs, 30 * 24 * 3600);
        }
        other => panic!("Expected Entitlements, got {:?}", other),
    }
}

#[tokio::test]
async fn test_grant_validates_before_mutating() {
    let h = harness();

    let reply = h
        .surface
        .handle(
            &owner(),
            ControlCommand::Grant {
                controller: "6".to_string(),
                days: 0,
            },
        )
        .await;
    assert!(matches!(reply, ControlReply::InvalidInput { ref field, .. } if field == "days"));

    let reply = h
        .surface
        .handle(
            &owner(),
            ControlCommand::Grant {
                controller: "six".to_string(),
                days: 3,
            },
        )
        .await;
    assert!(matches!(reply, ControlReply::InvalidInput { ref field, .. } if field == "controller"));
    assert!(h.surface.manager().registry().entitlements().active().is_empty());

    let reply = h
        .surface
        .handle(
            &owner(),
            ControlCommand::Grant {
                controller: "6".to_string(),
                days: 3,
            },
        )
        .await;
    assert!(matches!(reply, ControlReply::Granted { .. }));
    assert!(h
        .surface
        .manager()
        .registry()
        .entitlements()
        .is_entitled(&ControllerId::from("6")));
    h.notifier
        .wait_for(|n| matches!(n, Notice::EntitlementGranted { .. }))
        .await;

    let reply = h
        .surface
        .handle(
            &owner(),
            ControlCommand::Revoke {
                controller: "6".to_string(),
            },
        )
        .await;
    assert_eq!(
        reply,
        ControlReply::Revoked {
            controller: ControllerId::from("6"),
            existed: true
        }
    );
}

#[tokio::test]
async fn test_invalid_tenant_is_rejected() {
    let h = harness();
    let reply = h
        .surface
        .handle(
            &owner(),
            ControlCommand::RequestPairing {
                tenant: "12345".to_string(),
            },
        )
        .await;
    assert!(matches!(reply, ControlReply::InvalidInput { ref field, .. } if field == "tenant"));
    assert!(h.surface.manager().registry().active().list().is_empty());
}

#[tokio::test]
async fn test_status_reports_paired_tenant() {
    let mut h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);
    let _conn = pair(&mut h, &user, "+1 111 111 1111").await;

    match h.surface.handle(&user, ControlCommand::Status).await {
        ControlReply::Status {
            owner,
            tenant,
            state,
            connected,
            entitled_until,
        } => {
            assert!(!owner);
            assert_eq!(tenant, Some(TenantId::from("11111111111")));
            assert_eq!(state, Some(SessionState::Connected));
            assert!(connected);
            assert!(entitled_until.is_some());
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_requires_own_pairing() {
    let mut h = harness();
    let alice = ControllerId::from("5");
    let bob = ControllerId::from("6");
    grant(&h, &alice, 1);
    grant(&h, &bob, 1);
    let conn = pair(&mut h, &alice, "1111111111").await;

    let reply = h
        .surface
        .handle(
            &bob,
            ControlCommand::DeletePairing {
                tenant: "1111111111".to_string(),
            },
        )
        .await;
    assert_eq!(reply, ControlReply::NotPaired);
    assert!(!conn.handle.is_closed());

    let reply = h
        .surface
        .handle(
            &alice,
            ControlCommand::DeletePairing {
                tenant: "1111111111".to_string(),
            },
        )
        .await;
    assert_eq!(
        reply,
        ControlReply::PairingDeleted {
            tenant: TenantId::from("1111111111")
        }
    );
    assert!(conn.handle.is_closed());
    let registry = h.surface.manager().registry();
    assert!(registry.pairings().get(&alice).is_none());
    assert!(registry.active().list().is_empty());
}

#[tokio::test]
async fn test_operation_needs_live_connection() {
    let mut h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);

    let op = ControlCommand::Operation {
        op: "status".to_string(),
        args: json!({}),
    };
    assert_eq!(
        h.surface.handle(&user, op.clone()).await,
        ControlReply::NotConnected
    );

    let _conn = pair(&mut h, &user, "1111111111").await;
    assert_eq!(
        h.surface.handle(&user, op).await,
        ControlReply::OperationResult {
            result: json!({"op": "status"})
        }
    );
}

#[tokio::test]
async fn test_operations_on_one_tenant_never_overlap() {
    let mut h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);
    let conn = pair(&mut h, &user, "1111111111").await;

    let surface = Arc::new(h.surface);
    let mut running = Vec::new();
    for i in 0..5 {
        let surface = surface.clone();
        let user = user.clone();
        running.push(tokio::spawn(async move {
            surface
                .on_session_operation(
                    &user,
                    SessionOperation {
                        op: format!("op-{}", i),
                        args: json!(null),
                    },
                )
                .await
        }));
    }
    for task in running {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(conn.handle.executed().len(), 5);
    assert_eq!(conn.handle.max_in_flight(), 1);
}

#[tokio::test]
async fn test_reconcile_needs_pairing_unless_owner() {
    let h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);
    let registry = h.surface.manager().registry().clone();
    registry.active().add(&TenantId::from("111"));

    assert_eq!(
        h.surface.handle(&user, ControlCommand::Reconcile).await,
        ControlReply::Denied
    );

    match h.surface.handle(&owner(), ControlCommand::Reconcile).await {
        ControlReply::Reconciled(report) => {
            assert_eq!(report.removed, vec![TenantId::from("111")]);
            assert!(report.restart_required);
        }
        other => panic!("Expected Reconciled, got {:?}", other),
    }
}

#[tokio::test]
async fn test_list_tenants_includes_controllers() {
    let mut h = harness();
    let user = ControllerId::from("5");
    grant(&h, &user, 1);
    let _conn = pair(&mut h, &user, "1111111111").await;
    h.surface
        .manager()
        .registry()
        .credentials()
        .save(
            &TenantId::from("2222222222"),
            &CredentialState(json!({"k": 1})),
        )
        .await
        .unwrap();
    h.surface
        .manager()
        .registry()
        .active()
        .add(&TenantId::from("2222222222"));

    match h.surface.handle(&owner(), ControlCommand::ListTenants).await {
        ControlReply::Tenants { tenants } => {
            assert_eq!(tenants.len(), 2);
            assert_eq!(tenants[0].tenant, TenantId::from("1111111111"));
            assert!(tenants[0].connected);
            assert_eq!(tenants[0].controllers, vec![user]);
            assert!(!tenants[1].connected);
            assert_eq!(tenants[1].state, None);
        }
        other => panic!("Expected Tenants, got {:?}", other),
    }
}

#[test]
fn test_command_wire_format() {
    let command: ControlCommand =
        serde_json::from_str(r#"{"command": "grant", "controller": "6", "days": 7}"#).unwrap();
    assert_eq!(
        command,
        ControlCommand::Grant {
            controller: "6".to_string(),
            days: 7
        }
    );
    let command: ControlCommand =
        serde_json::from_str(r#"{"command": "operation", "op": "ping"}"#).unwrap();
    assert_eq!(
        command,
        ControlCommand::Operation {
            op: "ping".to_string(),
            args: serde_json::Value::Null
        }
    );
}
