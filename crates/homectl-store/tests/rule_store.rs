//! Behaviour shared by every `RuleStore` backend

use homectl_core::{Comparator, Condition, RuleDefinition, UNKNOWN_CATEGORY};
use homectl_store::{MemoryStore, RuleStore, SqliteStore};
use serde_json::json;

fn lighting_rule() -> RuleDefinition {
    RuleDefinition::new(
        "Ambient dimmer",
        55,
        vec![
            Condition::new("brightness", Comparator::Ge, 60),
            Condition::new("brightness", Comparator::Lt, 80),
            Condition::new("motion", Comparator::Eq, true),
            Condition::new("room", Comparator::Ne, "garage"),
        ],
        38,
        json!({"state": "on", "brightness": 40, "hue": 0, "saturation": 0.5})
            .as_object()
            .cloned()
            .unwrap(),
    )
}

async fn check_round_trip(store: &dyn RuleStore) {
    let definition = lighting_rule();
    let id = store.add_rule(&definition).await.unwrap();

    let rows = store.all_rules().await.unwrap();
    let row = rows.iter().find(|r| r.id == id).unwrap();

    assert_eq!(row.name, definition.name);
    assert_eq!(row.sensor_id, 55);
    assert_eq!(row.device_id, 38);
    assert_eq!(row.conditions, definition.conditions);
    assert_eq!(row.action, definition.action);
    assert!(row.enabled);
}

async fn check_enable_and_delete(store: &dyn RuleStore) {
    let first = store.add_rule(&lighting_rule()).await.unwrap();
    let second = store.add_rule(&lighting_rule()).await.unwrap();
    assert!(first < second);

    store.set_enabled(first, false).await.unwrap();
    let rows = store.all_rules().await.unwrap();
    assert!(!rows[0].enabled);
    assert!(rows[1].enabled);

    store.delete_rule(first).await.unwrap();
    // deleting twice is not an error
    store.delete_rule(first).await.unwrap();
    let rows = store.all_rules().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, second);
}

#[tokio::test]
async fn test_memory_round_trip() {
    check_round_trip(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_round_trip() {
    check_round_trip(&SqliteStore::open_in_memory().unwrap()).await;
}

#[tokio::test]
async fn test_memory_enable_and_delete() {
    check_enable_and_delete(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_enable_and_delete() {
    check_enable_and_delete(&SqliteStore::open_in_memory().unwrap()).await;
}

#[tokio::test]
async fn test_unknown_endpoints() {
    let stores: Vec<Box<dyn RuleStore>> = vec![
        Box::new(MemoryStore::new()),
        Box::new(SqliteStore::open_in_memory().unwrap()),
    ];

    for store in stores {
        assert_eq!(store.sensor_category(1).await.unwrap(), UNKNOWN_CATEGORY);
        assert_eq!(store.device_category(1).await.unwrap(), UNKNOWN_CATEGORY);
        assert!(store.sensor_categories().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_string_threshold_with_separator_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("homectl.db");
    let definition = RuleDefinition::new(
        "Party lights",
        55,
        vec![
            Condition::new("scene", Comparator::Eq, "R&B"),
            Condition::new("scene", Comparator::Ne, "<off>"),
        ],
        38,
        json!({"state": "on"}).as_object().cloned().unwrap(),
    );

    let id = {
        let store = SqliteStore::open(&path).unwrap();
        store.add_rule(&definition).await.unwrap()
    };

    let store = SqliteStore::open(&path).unwrap();
    let rows = store.all_rules().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].conditions, definition.conditions);
}
