use super::*;
use proptest::prelude::*;
use tempfile::tempdir;

fn controller(id: &str) -> ControllerId {
    ControllerId::from(id)
}

fn tenant(id: &str) -> TenantId {
    TenantId::from(id)
}

#[test]
fn test_set_overwrites_previous_tenant() {
    let dir = tempdir().unwrap();
    let registry = PairingRegistry::load(dir.path().join("pairings.json"));

    registry.set(controller("1"), tenant("1111111111"));
    registry.set(controller("1"), tenant("2222222222"));

    assert_eq!(registry.get(&controller("1")), Some(tenant("2222222222")));
    assert_eq!(registry.entries().len(), 1);
}

#[test]
fn test_pairings_survive_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pairings.json");

    {
        let registry = PairingRegistry::load(path.clone());
        registry.set(controller("1"), tenant("1111111111"));
        registry.set(controller("2"), tenant("1111111111"));
        registry.set(controller("3"), tenant("2222222222"));
    }

    let reloaded = PairingRegistry::load(path);
    assert_eq!(reloaded.get(&controller("2")), Some(tenant("1111111111")));
    assert_eq!(
        reloaded.paired_tenants().into_iter().collect::<Vec<_>>(),
        vec![tenant("1111111111"), tenant("2222222222")]
    );
}

#[test]
fn test_remove_tenant_strips_every_controller() {
    let dir = tempdir().unwrap();
    let registry = PairingRegistry::load(dir.path().join("pairings.json"));
    registry.set(controller("1"), tenant("1111111111"));
    registry.set(controller("2"), tenant("1111111111"));
    registry.set(controller("3"), tenant("2222222222"));

    assert_eq!(registry.remove_tenant(&tenant("1111111111")), 2);
    assert_eq!(registry.remove_tenant(&tenant("1111111111")), 0);
    assert!(registry.controllers_of(&tenant("1111111111")).is_empty());
    assert_eq!(registry.controllers_of(&tenant("2222222222")), vec![controller("3")]);
}

#[test]
fn test_remove_reports_presence() {
    let dir = tempdir().unwrap();
    let registry = PairingRegistry::load(dir.path().join("pairings.json"));
    registry.set(controller("1"), tenant("1111111111"));

    assert!(registry.remove(&controller("1")));
    assert!(!registry.remove(&controller("1")));
    assert_eq!(registry.get(&controller("1")), None);
}

#[test]
fn test_duplicate_rows_on_disk_keep_last() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pairings.json");
    std::fs::write(
        &path,
        r#"[
            {"controller_id": "1", "tenant_id": "1111111111"},
            {"controller_id": "1", "tenant_id": "2222222222"}
        ]"#,
    )
    .unwrap();

    let registry = PairingRegistry::load(path);
    assert_eq!(registry.get(&controller("1")), Some(tenant("2222222222")));
    assert_eq!(registry.entries().len(), 1);
}

#[test]
fn test_corrupt_table_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pairings.json");
    std::fs::write(&path, "not json").unwrap();

    let registry = PairingRegistry::load(path);
    assert!(registry.entries().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_at_most_one_tenant_per_controller(
        ops in proptest::collection::vec((0u8..4, 0u8..4), 1..40)
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairings.json");
        let registry = PairingRegistry::load(path.clone());
        let mut expected = std::collections::BTreeMap::new();

        for (c, t) in ops {
            let c_id = controller(&c.to_string());
            let t_id = tenant(&format!("100000000{}", t));
            registry.set(c_id.clone(), t_id.clone());
            expected.insert(c_id, t_id);
        }

        let entries = registry.entries();
        let controllers: BTreeSet<_> = entries.iter().map(|e| e.controller_id.clone()).collect();
        prop_assert_eq!(controllers.len(), entries.len());

        let reloaded = PairingRegistry::load(path);
        for (c, t) in &expected {
            prop_assert_eq!(reloaded.get(c), Some(t.clone()));
        }
    }
}
