//! Connection manager tests against a scripted feed

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::clock::ManualClock;
use crate::config::FeedConfig;
use crate::driver::KEEPALIVE_FRAME;
use crate::laps::{LapDetector, LapStore};
use crate::store::MemoryDocumentStore;
use crate::test_utils::{ScriptedTransport, drivers_frame, last_lap_frame};
use crate::types::{ConnectionState, UpdateRate};

fn config() -> FeedConfig {
    FeedConfig { url_template: "ws://feed.test/{circuit}".to_string(), ..FeedConfig::default() }
}

fn manager(transport: &Arc<ScriptedTransport>) -> TelemetryConnectionManager {
    TelemetryConnectionManager::new(config(), transport.clone(), Arc::new(ManualClock::new(0)))
}

async fn wait_for_state(manager: &TelemetryConnectionManager, wanted: ConnectionState) {
    let mut states = manager.state_receiver();
    states.wait_for(|state| *state == wanted).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_fills_url_template_and_streams_updates() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();

    assert!(manager.connect("C1").await);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transport.urls(), vec!["ws://feed.test/C1"]);
    assert_eq!(manager.current_circuit().await.as_deref(), Some("C1"));

    feed.send_json(&drivers_frame(&[("7", &[("position", "1"), ("last_lap", "1:26.500")])]));
    let update = updates.next().await.unwrap();
    assert_eq!(update.circuit_id, "C1");
    assert_eq!(update.karts["7"].get("last_lap"), Some("1:26.500"));
}

#[tokio::test(start_paused = true)]
async fn partial_ticks_never_erase_fields() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    feed.send_json(&drivers_frame(&[("7", &[("position", "1"), ("last_lap", "1:26.500")])]));
    feed.send_json(&json!({"data": {"drivers": {"7": {"position": "2", "last_lap": "  ", "gap": null}}}}));
    feed.send_json(&json!({"karting_data": {"drivers": {"7": {"last_lap": "--:--"}}}}));
    for _ in 0..3 {
        updates.next().await.unwrap();
    }

    let kart = manager.kart_data("7").unwrap();
    assert_eq!(kart.get("position"), Some("2"));
    assert_eq!(kart.get("last_lap"), Some("1:26.500"));
    assert_eq!(kart.get("gap"), None);
}

#[tokio::test(start_paused = true)]
async fn kart_data_is_a_defensive_copy() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    feed.send_json(&last_lap_frame("7", "1:26.500"));
    updates.next().await.unwrap();

    let mut copy = manager.all_karts_data();
    copy.clear();
    assert_eq!(manager.all_karts_data().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_control_messages_are_not_forwarded() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    feed.send("not json");
    feed.send(r#"{"type":"karting_data"}"#);
    feed.send(r#"{"type":"pong"}"#);
    feed.send(r#"{"type":"status_update","status":"green"}"#);
    feed.send(r#"{"type":"error","message":"timing offline"}"#);
    feed.send_json(&json!({"drivers": {"9": {"pos": "1"}}, "column_order": ["pos", "kart"]}));

    let update = updates.next().await.unwrap();
    assert!(update.karts.contains_key("9"));
    assert_eq!(update.column_order, vec!["pos", "kart"]);
    assert_eq!(manager.malformed_messages(), 2);
    assert_eq!(manager.column_order(), vec!["pos", "kart"]);
}

#[tokio::test(start_paused = true)]
async fn keepalive_is_sent_every_interval() {
    let transport = ScriptedTransport::new();
    let _feed = transport.accept();
    let manager = manager(&transport);
    manager.connect("C1").await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(transport.sent_frames().is_empty());

    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(transport.sent_frames(), vec![KEEPALIVE_FRAME.to_string(); 2]);
}

#[tokio::test(start_paused = true)]
async fn failed_initial_connect_stays_disconnected() {
    let transport = ScriptedTransport::new();
    transport.refuse("no such circuit");
    let manager = manager(&transport);

    assert!(!manager.connect("C1").await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.last_error().unwrap().contains("no such circuit"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_attempt_is_bounded_by_timeout() {
    let transport = ScriptedTransport::new();
    transport.hang();
    let manager = manager(&transport);

    let started = tokio::time::Instant::now();
    assert!(!manager.connect("C1").await);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(manager.last_error().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_a_hanging_connect() {
    let transport = ScriptedTransport::new();
    transport.hang();
    let manager = Arc::new(manager(&transport));
    let connecting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("C1").await }
    });
    wait_for_state(&manager, ConnectionState::Connecting).await;

    let started = tokio::time::Instant::now();
    manager.disconnect().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!connecting.await.unwrap());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects() {
    let transport = ScriptedTransport::new();
    let first = transport.accept();
    transport.refuse("still down");
    let second = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    first.fail("reset by peer");
    wait_for_state(&manager, ConnectionState::Reconnecting { attempt: 2 }).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(transport.attempts(), 3);

    second.send_json(&last_lap_frame("7", "1:25.100"));
    assert_eq!(updates.next().await.unwrap().karts["7"].get("last_lap"), Some("1:25.100"));
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_five_attempts() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    for n in 1..=5 {
        transport.refuse(format!("refused {n}"));
    }
    let manager = manager(&transport);
    manager.connect("C1").await;

    feed.close();
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(transport.attempts(), 6);
    assert!(manager.last_error().unwrap().contains("refused 5"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.attempts(), 6);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let _again = transport.accept();
    assert!(manager.reconnect().await);
    assert_eq!(transport.attempts(), 7);
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_wins_over_reconnect_loop() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    feed.send_json(&last_lap_frame("7", "1:26.500"));
    updates.next().await.unwrap();
    feed.close();
    wait_for_state(&manager, ConnectionState::Reconnecting { attempt: 1 }).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.all_karts_data().is_empty());
    assert!(manager.current_circuit().await.is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn switching_circuits_clears_state() {
    let transport = ScriptedTransport::new();
    let c1 = transport.accept();
    let _c2 = transport.accept();
    let manager = manager(&transport);
    let mut updates = manager.subscribe();

    manager.connect("C1").await;
    assert!(manager.connect("C1").await);
    assert_eq!(transport.attempts(), 1);

    c1.send_json(&json!({"drivers": {"7": {"pos": "1"}}, "columns": ["pos"]}));
    updates.next().await.unwrap();

    assert!(manager.connect("C2").await);
    assert!(manager.all_karts_data().is_empty());
    assert!(manager.column_order().is_empty());
    assert_eq!(transport.urls(), vec!["ws://feed.test/C1", "ws://feed.test/C2"]);
    assert_eq!(manager.current_circuit().await.as_deref(), Some("C2"));

    // Frames still queued on the old connection are never applied.
    c1.send_json(&last_lap_frame("7", "1:26.500"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.all_karts_data().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lap_detection_follows_toggle() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(LapStore::new(Arc::new(MemoryDocumentStore::new()), clock.clone()));
    store.start_session("C1").await.unwrap();
    let detector = Arc::new(LapDetector::new(store.clone()));

    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = TelemetryConnectionManager::with_lap_detector(config(), transport.clone(), clock, detector);
    let mut updates = manager.subscribe();
    manager.connect("C1").await;

    feed.send_json(&last_lap_frame("7", "1:26.500"));
    updates.next().await.unwrap();
    assert!(manager.lap_counters().is_empty());
    assert!(!manager.lap_detection_enabled());

    manager.enable_lap_detection(true);
    assert!(manager.lap_detection_enabled());
    for time in ["1:26.500", "1:25.100", "1:25.100", "1:24.900"] {
        feed.send_json(&last_lap_frame("7", time));
        updates.next().await.unwrap();
    }
    assert_eq!(manager.lap_counters().get("7"), Some(&3));
    assert_eq!(store.recorded_lap_count("7").await.unwrap(), 3);

    manager.disconnect().await;
    assert!(manager.lap_counters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn throttled_subscription_merges_bursts() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let manager = manager(&transport);
    let mut throttled = manager.subscribe_throttled(UpdateRate::Max(2));
    manager.connect("C1").await;

    feed.send_json(&last_lap_frame("7", "1:26.500"));
    assert!(throttled.next().await.unwrap().karts.contains_key("7"));

    feed.send_json(&last_lap_frame("9", "1:27.000"));
    feed.send_json(&last_lap_frame("11", "1:28.000"));
    let merged = throttled.next().await.unwrap();
    assert_eq!(merged.karts.keys().collect::<Vec<_>>(), vec!["11", "9"]);
}
