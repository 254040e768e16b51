//! End-to-end rule engine behaviour over the in-memory store and broker

use chrono::{DateTime, Duration, TimeZone, Utc};
use homectl_core::RuleDefinition;
use homectl_rules::{EngineConfig, EventOutcome, RuleEngine};
use homectl_store::{EndpointRecord, MemoryStore, RuleStore};
use homectl_transport::{InboundMessage, MemoryBroker, Qos, Transport};
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    engine: Arc<RuleEngine>,
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.upsert_sensor(EndpointRecord::new(100, "Living room", "temperature", "DHT22"));
    store.upsert_sensor(EndpointRecord::new(55, "Hallway", "light", "BH1750"));
    store.upsert_device(EndpointRecord::new(200, "Radiator", "temperature", "TRV"));
    store.upsert_device(EndpointRecord::new(201, "Fan", "temperature", "Relay"));
    store.upsert_device(EndpointRecord::new(38, "Hallway lamp", "light", "Hue"));

    let broker = MemoryBroker::new();
    let (transport, _) = broker.connect();
    let engine = RuleEngine::new(
        store.clone(),
        Arc::new(transport),
        EngineConfig::default(),
    );

    Harness {
        engine: Arc::new(engine),
        store,
        broker,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 7, 30, 0).unwrap()
}

fn definition(name: &str, conditions: Value, device_id: i64, action: Value) -> RuleDefinition {
    RuleDefinition::from_json(name, 100, &conditions, device_id, &action).unwrap()
}

fn heating() -> RuleDefinition {
    definition(
        "Heat when cold",
        json!({"temperature": "<18"}),
        200,
        json!({"state": "on", "temperature": 22}),
    )
}

fn commands(broker: &MemoryBroker, topic: &str) -> Vec<Value> {
    broker
        .published_to(topic)
        .iter()
        .map(|p| serde_json::from_slice(&p.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_cold_reading_turns_heating_on() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();

    let outcome = h
        .engine
        .handle_message(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 17}"#,
            t0(),
        )
        .await;

    assert_eq!(
        outcome,
        EventOutcome::Fired {
            rule_id: id,
            dispatched: true
        }
    );
    assert_eq!(
        commands(&h.broker, "temperature/send"),
        vec![json!({"device_id": 200, "state": "on", "temperature": 22})]
    );
    assert_eq!(h.broker.published()[0].qos, Qos::AtLeastOnce);

    let executions = h.store.executions(id);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].executed_at, t0());
}

#[tokio::test]
async fn test_warm_reading_dispatches_nothing() {
    let h = harness();
    h.engine.add_rule(heating()).await.unwrap();

    let outcome = h
        .engine
        .handle_message(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 19}"#,
            t0(),
        )
        .await;

    assert_eq!(outcome, EventOutcome::NoMatch);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_missing_field_dispatches_nothing() {
    let h = harness();
    h.engine.add_rule(heating()).await.unwrap();

    let outcome = h
        .engine
        .handle_message("temperature/get", br#"{"sensor_id": 100, "humidity": 40}"#, t0())
        .await;

    assert_eq!(outcome, EventOutcome::NoMatch);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_lowest_id_wins() {
    let h = harness();
    let first = h.engine.add_rule(heating()).await.unwrap();
    let second = h
        .engine
        .add_rule(definition(
            "Fan when cold",
            json!({"temperature": "<20"}),
            201,
            json!({"state": "off"}),
        ))
        .await
        .unwrap();
    assert!(first < second);

    let outcome = h
        .engine
        .handle_message(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 17}"#,
            t0(),
        )
        .await;

    assert!(matches!(outcome, EventOutcome::Fired { rule_id, .. } if rule_id == first));
    let sent = commands(&h.broker, "temperature/send");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["device_id"], json!(200));
    assert!(h.store.executions(second).is_empty());
}

#[tokio::test]
async fn test_disabled_rule_yields_to_next() {
    let h = harness();
    let first = h.engine.add_rule(heating()).await.unwrap();
    let second = h
        .engine
        .add_rule(definition(
            "Fan when cold",
            json!({"temperature": "<20"}),
            201,
            json!({"state": "off"}),
        ))
        .await
        .unwrap();

    h.engine.set_enabled(first, false).await.unwrap();
    let cold = br#"{"sensor_id": 100, "temperature": 17}"#;

    let outcome = h.engine.handle_message("temperature/get", cold, t0()).await;
    assert!(matches!(outcome, EventOutcome::Fired { rule_id, .. } if rule_id == second));

    h.engine.set_enabled(first, true).await.unwrap();
    let outcome = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(1))
        .await;
    assert!(matches!(outcome, EventOutcome::Fired { rule_id, .. } if rule_id == first));
}

#[tokio::test]
async fn test_cooldown_suppresses_repeat_firing() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();
    let cold = br#"{"sensor_id": 100, "temperature": 17}"#;

    let first = h.engine.handle_message("temperature/get", cold, t0()).await;
    let early = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(3))
        .await;
    let late = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(6))
        .await;

    assert!(matches!(first, EventOutcome::Fired { .. }));
    assert_eq!(early, EventOutcome::Suppressed { rule_id: id });
    assert!(matches!(late, EventOutcome::Fired { .. }));
    assert_eq!(h.broker.published().len(), 2);
    assert_eq!(h.engine.last_fired(id).await, Some(t0() + Duration::seconds(6)));
}

#[tokio::test]
async fn test_cooling_rule_yields_to_next_match() {
    let h = harness();
    let first = h.engine.add_rule(heating()).await.unwrap();
    let second = h
        .engine
        .add_rule(definition(
            "Fan when cold",
            json!({"temperature": "<20"}),
            201,
            json!({"state": "off"}),
        ))
        .await
        .unwrap();
    let cold = br#"{"sensor_id": 100, "temperature": 17}"#;

    h.engine.handle_message("temperature/get", cold, t0()).await;
    let outcome = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(1))
        .await;

    assert_eq!(
        outcome,
        EventOutcome::Fired {
            rule_id: second,
            dispatched: true
        }
    );
    assert_eq!(h.store.executions(second).len(), 1);
    assert_eq!(
        commands(&h.broker, "temperature/send"),
        vec![
            json!({"device_id": 200, "state": "on", "temperature": 22}),
            json!({"device_id": 201, "state": "off"}),
        ]
    );

    // Both rules cooling down: the lowest id is reported
    let outcome = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(2))
        .await;
    assert_eq!(outcome, EventOutcome::Suppressed { rule_id: first });
    assert_eq!(h.broker.published().len(), 2);
}

#[tokio::test]
async fn test_deleted_rule_stops_firing() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();
    let cold = br#"{"sensor_id": 100, "temperature": 17}"#;
    h.engine.handle_message("temperature/get", cold, t0()).await;

    assert!(h.engine.delete_rule(id).await.unwrap());
    assert!(!h.engine.delete_rule(id).await.unwrap());
    assert_eq!(h.engine.last_fired(id).await, None);

    let outcome = h
        .engine
        .handle_message("temperature/get", cold, t0() + Duration::seconds(10))
        .await;
    assert_eq!(outcome, EventOutcome::NoMatch);
}

#[tokio::test]
async fn test_compound_brightness_band() {
    let h = harness();
    let id = h
        .engine
        .add_rule(
            RuleDefinition::from_json(
                "Dim hallway",
                55,
                &json!({"brightness": ">=60 & <80"}),
                38,
                &json!({"state": "on", "brightness": 40}),
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let outcome = h
        .engine
        .handle_message("light/get", br#"{"sensor_id": 55, "brightness": 90}"#, t0())
        .await;
    assert_eq!(outcome, EventOutcome::NoMatch);

    let outcome = h
        .engine
        .handle_message("light/get", br#"{"sensor_id": "55", "brightness": "70"}"#, t0())
        .await;
    assert!(matches!(outcome, EventOutcome::Fired { rule_id, .. } if rule_id == id));
    assert_eq!(
        commands(&h.broker, "light/send"),
        vec![json!({"device_id": 38, "state": "on", "brightness": 40})]
    );
}

#[tokio::test]
async fn test_dispatch_failure_still_records_firing() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();
    h.broker.set_offline(true);

    let outcome = h
        .engine
        .handle_message(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 17}"#,
            t0(),
        )
        .await;

    assert_eq!(
        outcome,
        EventOutcome::Fired {
            rule_id: id,
            dispatched: false
        }
    );
    assert_eq!(h.engine.last_fired(id).await, Some(t0()));
    assert_eq!(h.store.executions(id).len(), 1);
}

#[tokio::test]
async fn test_execution_log_failure_is_not_fatal() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();
    h.store.set_unavailable(true);

    let outcome = h
        .engine
        .handle_message(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 17}"#,
            t0(),
        )
        .await;

    assert!(matches!(outcome, EventOutcome::Fired { dispatched: true, .. }));
    assert_eq!(h.engine.last_fired(id).await, Some(t0()));
}

#[tokio::test]
async fn test_reload_picks_up_store_changes() {
    let h = harness();
    let id = h.engine.add_rule(heating()).await.unwrap();

    // Another process disables the rule directly in the store
    tokio_test::assert_ok!(h.store.set_enabled(id, false).await);
    assert!(h.engine.rule(id).await.unwrap().enabled);

    assert_eq!(h.engine.load_rules().await.unwrap(), 1);
    assert!(!h.engine.rule(id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_run_survives_bad_input() {
    let h = harness();
    h.engine.add_rule(heating()).await.unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.run(rx).await });

    tx.send(InboundMessage::new("temperature/get", b"\xff\xfe".to_vec()))
        .await
        .unwrap();
    tx.send(InboundMessage::new("temperature/get", b"[1, 2]".to_vec()))
        .await
        .unwrap();
    tx.send(InboundMessage::new(
        "temperature/get",
        br#"{"sensor_id": 100, "temperature": 17}"#.to_vec(),
    ))
    .await
    .unwrap();
    drop(tx);

    task.await.unwrap();
    assert!(!h.engine.is_running());
    assert_eq!(commands(&h.broker, "temperature/send").len(), 1);
}

#[tokio::test]
async fn test_stop_ends_run_loop() {
    let h = harness();
    let (_tx, rx) = tokio::sync::mpsc::channel::<InboundMessage>(1);
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.run(rx).await });

    while !h.engine.is_running() {
        tokio::task::yield_now().await;
    }
    h.engine.stop();

    task.await.unwrap();
    assert!(!h.engine.is_running());
}

#[tokio::test]
async fn test_broker_delivery_reaches_engine() {
    let h = harness();
    h.engine.add_rule(heating()).await.unwrap();

    let (controller, inbound) = h.broker.connect();
    controller
        .subscribe("temperature/get", Qos::AtLeastOnce)
        .await
        .unwrap();
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.run(inbound).await });

    let (sensor, _) = h.broker.connect();
    sensor
        .publish(
            "temperature/get",
            br#"{"sensor_id": 100, "temperature": 16.5}"#.to_vec(),
            Qos::AtMostOnce,
        )
        .await
        .unwrap();

    for _ in 0..100 {
        if !h.broker.published_to("temperature/send").is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    h.engine.stop();
    task.await.unwrap();

    assert_eq!(
        commands(&h.broker, "temperature/send"),
        vec![json!({"device_id": 200, "state": "on", "temperature": 22})]
    );
}

#[tokio::test]
async fn test_concurrent_events_fire_once_within_cooldown() {
    let h = harness();
    h.engine.add_rule(heating()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .handle_message(
                    "temperature/get",
                    br#"{"sensor_id": 100, "temperature": 17}"#,
                    t0() + Duration::milliseconds(i * 100),
                )
                .await
        }));
    }

    let mut fired = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), EventOutcome::Fired { .. }) {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);
    assert_eq!(h.broker.published().len(), 1);
}
