//! End-to-end engine scenarios against the mock transport.
//!
//! Every test runs on a paused Tokio clock, so backoff delays, pending
//! timeouts and health intervals elapse instantly and deterministically.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_client::{
    confirm_with, Cache, ChangeEvent, ChannelStatus, ConfirmError, EngineConfig, EngineError, EntityId,
    EventKind, InMemoryCache, MockTransport, Origin, Predicate, RetryPolicy, SpeculativeWrite,
    SubscriptionConfig, SubscriptionHandle, SubscriptionState, SyncEngine, SyncNotification,
    Topic, UpdateOutcome,
};

type Engine = SyncEngine<MockTransport, InMemoryCache>;
type Seen = Arc<Mutex<Vec<SyncNotification>>>;

// ============================================================================
// Helpers
// ============================================================================

fn engine(config: EngineConfig) -> (Engine, MockTransport) {
    let transport = MockTransport::new();
    let engine = SyncEngine::new(config, transport.clone(), InMemoryCache::new()).unwrap();
    (engine, transport)
}

fn quiet_config() -> EngineConfig {
    EngineConfig::default().with_health_monitor(false)
}

fn subscribe_recording(engine: &Engine, config: SubscriptionConfig) -> (Seen, SubscriptionHandle) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = engine
        .subscribe(config, move |n| sink.lock().unwrap().push(n.clone()))
        .unwrap();
    (seen, handle)
}

async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn orders() -> Topic {
    Topic::new("orders")
}

fn order_update(id: &str, status: &str) -> ChangeEvent {
    ChangeEvent::remote(
        EventKind::Update,
        "orders",
        Some(json!({"id": id, "status": "pending"})),
        Some(json!({"id": id, "status": status})),
    )
}

fn cached(engine: &Engine, id: &str) -> Option<Value> {
    engine.cache().get(&orders(), &EntityId::new(id))
}

fn seed(engine: &Engine, id: &str, value: Value) {
    engine.cache().upsert(&orders(), &EntityId::new(id), value);
}

// ============================================================================
// Change events
// ============================================================================

/// A remote update lands in the cache and reaches the listener.
#[tokio::test(start_paused = true)]
async fn remote_update_reaches_cache_and_listener() {
    let (engine, transport) = engine(quiet_config());
    let (seen, _handle) = subscribe_recording(&engine, SubscriptionConfig::new("orders"));
    advance(1).await;

    assert_eq!(transport.emit(&orders(), order_update("42", "shipped")), 1);
    advance(150).await;

    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        SyncNotification::Change(event) => {
            assert_eq!(event.origin, Origin::Remote);
            assert_eq!(event.new.as_ref().unwrap()["status"], "shipped");
        }
        other => panic!("unexpected notification: {:?}", other),
    }
}

/// Redelivered events leave the cache as if applied once.
#[tokio::test(start_paused = true)]
async fn duplicate_events_apply_once() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    let event = order_update("42", "shipped");
    transport.emit(&orders(), event.clone());
    transport.emit(&orders(), event);
    advance(150).await;

    assert_eq!(engine.cache().collection_len(&orders()), 1);
    assert_eq!(engine.cache().invalidations(&orders()), 1);
}

/// Remote deletes remove the entity.
#[tokio::test(start_paused = true)]
async fn remote_delete_removes_entity() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;
    seed(&engine, "42", json!({"id": "42", "status": "pending"}));

    transport.emit(
        &orders(),
        ChangeEvent::remote(EventKind::Delete, "orders", Some(json!({"id": "42"})), None),
    );
    advance(1).await;

    assert!(cached(&engine, "42").is_none());
}

/// An older event redelivered after a newer one does not roll the cache back.
#[tokio::test(start_paused = true)]
async fn redelivered_older_event_is_ignored() {
    let (engine, transport) = engine(quiet_config());
    let (seen, _handle) = subscribe_recording(&engine, SubscriptionConfig::new("orders"));
    advance(1).await;

    let older = order_update("42", "pending").with_timestamp(1_000);
    transport.emit(&orders(), older.clone());
    transport.emit(&orders(), order_update("42", "shipped").with_timestamp(2_000));
    advance(150).await;
    let delivered = seen.lock().unwrap().len();

    transport.emit(&orders(), older);
    advance(150).await;

    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
    assert_eq!(seen.lock().unwrap().len(), delivered);
}

/// A create replayed after the entity's delete does not resurrect it.
#[tokio::test(start_paused = true)]
async fn replayed_create_after_delete_stays_deleted() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    let create = ChangeEvent::remote(
        EventKind::Create,
        "orders",
        None,
        Some(json!({"id": "42", "status": "pending"})),
    )
    .with_timestamp(1_000);
    transport.emit(&orders(), create.clone());
    transport.emit(
        &orders(),
        ChangeEvent::remote(EventKind::Delete, "orders", Some(json!({"id": "42"})), None)
            .with_timestamp(2_000),
    );
    transport.emit(&orders(), create);
    advance(150).await;

    assert!(cached(&engine, "42").is_none());
}

/// Events outside a subscription's predicate still update the cache and
/// confirm pending writes; only the listener is spared.
#[tokio::test(start_paused = true)]
async fn predicate_does_not_block_confirmation() {
    let (engine, transport) = engine(quiet_config());
    let config = SubscriptionConfig::new("orders")
        .with_predicate(Predicate::eq("status", json!("pending")));
    let (seen, _handle) = subscribe_recording(&engine, config);
    advance(1).await;
    seed(&engine, "42", json!({"id": "42", "status": "pending"}));

    let handle = engine
        .perform_optimistic_update(
            SpeculativeWrite::update(
                "orders",
                "42",
                json!({"id": "42", "status": "shipped"}),
                json!({"id": "42", "status": "pending"}),
            ),
            None,
        )
        .unwrap();
    transport.emit(&orders(), order_update("42", "shipped"));

    let outcome = handle.outcome().await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Confirmed { .. }));
    advance(6_000).await;

    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|n| !matches!(n, SyncNotification::RolledBack { .. })));
    assert_eq!(engine.status().pending_updates, 0);
}

/// An entity moving out of the predicate is cached with its new value.
#[tokio::test(start_paused = true)]
async fn entity_leaving_predicate_is_not_left_stale() {
    let (engine, transport) = engine(quiet_config());
    let config = SubscriptionConfig::new("orders")
        .with_predicate(Predicate::eq("status", json!("pending")));
    let (seen, _handle) = subscribe_recording(&engine, config);
    advance(1).await;

    transport.emit(&orders(), order_update("42", "pending"));
    advance(150).await;
    transport.emit(&orders(), order_update("42", "shipped"));
    advance(150).await;

    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
    assert_eq!(seen.lock().unwrap().len(), 1);
}

/// A burst on one topic produces a single listener call; the cache keeps every change.
#[tokio::test(start_paused = true)]
async fn burst_is_debounced_for_listeners() {
    let (engine, transport) = engine(quiet_config());
    let (seen, _handle) = subscribe_recording(&engine, SubscriptionConfig::new("orders"));
    advance(1).await;

    for i in 0..10 {
        transport.emit(&orders(), order_update(&i.to_string(), "new"));
        advance(5).await;
    }
    advance(150).await;

    assert_eq!(engine.cache().collection_len(&orders()), 10);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(&seen[0], SyncNotification::Change(e) if e.new.as_ref().unwrap()["id"] == "9"));
}

// ============================================================================
// Optimistic updates
// ============================================================================

/// A rejected write restores the previous value and reports the reason.
#[tokio::test(start_paused = true)]
async fn rejected_update_restores_previous_value() {
    let (engine, _transport) = engine(quiet_config());
    let (seen, _handle) = subscribe_recording(&engine, SubscriptionConfig::new("orders"));
    advance(1).await;
    seed(&engine, "42", json!({"status": "pending"}));

    let (reject_tx, reject_rx) = tokio::sync::oneshot::channel::<()>();
    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::update(
                "orders",
                "42",
                json!({"status": "shipped"}),
                json!({"status": "pending"}),
            ),
            Some(confirm_with(async move {
                let _ = reject_rx.await;
                Err(ConfirmError::from("payment declined"))
            })),
        )
        .unwrap();

    // Speculative value is visible before confirmation
    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");

    reject_tx.send(()).unwrap();
    let result = pending.outcome().await;
    assert!(matches!(
        result,
        Err(EngineError::ConfirmationFailed { ref reason, .. }) if reason == "payment declined"
    ));
    assert_eq!(cached(&engine, "42"), Some(json!({"status": "pending"})));

    advance(1).await;
    let seen = seen.lock().unwrap();
    assert!(matches!(
        seen.last(),
        Some(SyncNotification::RolledBack { restored: Some(v), .. }) if v["status"] == "pending"
    ));
}

/// An unconfirmed write rolls back once the pending timeout elapses.
#[tokio::test(start_paused = true)]
async fn unconfirmed_update_times_out() {
    let (engine, _transport) = engine(quiet_config());
    seed(&engine, "42", json!({"status": "pending"}));

    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::update(
                "orders",
                "42",
                json!({"status": "shipped"}),
                json!({"status": "pending"}),
            ),
            None,
        )
        .unwrap();

    advance(4_900).await;
    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
    assert_eq!(engine.status().pending_updates, 1);

    advance(200).await;
    assert_eq!(cached(&engine, "42").unwrap()["status"], "pending");
    assert_eq!(engine.status().live_timers, 0);
    assert!(matches!(
        pending.outcome().await,
        Err(EngineError::TimedOut { timeout, .. }) if timeout == Duration::from_secs(5)
    ));
}

/// A remote event for the written entity confirms the write.
#[tokio::test(start_paused = true)]
async fn matching_event_confirms_pending_write() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::update(
                "orders",
                "42",
                json!({"status": "shipped"}),
                json!({"status": "pending"}),
            ),
            None,
        )
        .unwrap();
    advance(300).await;
    transport.emit(&orders(), order_update("42", "shipped"));

    assert_eq!(
        pending.outcome().await.unwrap(),
        UpdateOutcome::Confirmed {
            value: Some(json!({"id": "42", "status": "shipped"}))
        }
    );

    // Nothing left to roll back
    advance(10_000).await;
    assert_eq!(cached(&engine, "42").unwrap()["status"], "shipped");
}

/// A second write on the same entity keeps exactly one live timer.
#[tokio::test(start_paused = true)]
async fn superseding_write_keeps_one_timer() {
    let (engine, _transport) = engine(quiet_config());

    let first = engine
        .perform_optimistic_update(
            SpeculativeWrite::update("orders", "42", json!({"v": 1}), json!({"v": 0})),
            None,
        )
        .unwrap();
    advance(1_000).await;
    let _second = engine
        .perform_optimistic_update(
            SpeculativeWrite::update("orders", "42", json!({"v": 2}), json!({"v": 1})),
            None,
        )
        .unwrap();

    assert_eq!(first.outcome().await.unwrap(), UpdateOutcome::Superseded);
    let status = engine.status();
    assert_eq!(status.pending_updates, 1);
    assert_eq!(status.live_timers, 1);

    // The superseded deadline (t=5s) no longer fires
    advance(4_500).await;
    assert_eq!(cached(&engine, "42"), Some(json!({"v": 2})));
}

/// A failed create leaves no trace; a failed delete brings the entity back.
#[tokio::test(start_paused = true)]
async fn failed_create_and_delete_roll_back() {
    let (engine, _transport) = engine(quiet_config());
    seed(&engine, "7", json!({"id": "7"}));

    let create = engine
        .perform_optimistic_update(
            SpeculativeWrite::create("orders", "new", json!({"id": "new"})),
            Some(confirm_with(async { Err(ConfirmError::from("conflict")) })),
        )
        .unwrap();
    let delete = engine
        .perform_optimistic_update(
            SpeculativeWrite::delete("orders", "7", json!({"id": "7"})),
            Some(confirm_with(async { Err(ConfirmError::from("forbidden")) })),
        )
        .unwrap();
    assert!(cached(&engine, "7").is_none());

    assert!(create.outcome().await.is_err());
    assert!(delete.outcome().await.is_err());
    assert!(cached(&engine, "new").is_none());
    assert_eq!(cached(&engine, "7"), Some(json!({"id": "7"})));
}

/// Pending timeout and match window come from TOML.
#[tokio::test(start_paused = true)]
async fn toml_config_drives_timeouts() {
    let config = EngineConfig::from_toml_str(
        r#"
        [ledger]
        timeout_ms = 1000

        [health]
        enabled = false
        "#,
    )
    .unwrap();
    let (engine, _transport) = engine(config);

    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::create("orders", "1", json!({"id": "1"})),
            None,
        )
        .unwrap();
    advance(1_100).await;

    assert!(cached(&engine, "1").is_none());
    assert!(matches!(
        pending.outcome().await,
        Err(EngineError::TimedOut { timeout, .. }) if timeout == Duration::from_secs(1)
    ));
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

/// Five consecutive failures exhaust the budget after 1+2+4+8 seconds of backoff.
#[tokio::test(start_paused = true)]
async fn five_failures_mark_subscription_permanently_failed() {
    let (engine, transport) = engine(quiet_config());
    transport.fail_all_opens("connection refused");
    let (seen, _handle) = subscribe_recording(&engine, SubscriptionConfig::new("orders"));

    // Attempts at t=0, 1, 3, 7, 15
    advance(500).await;
    assert_eq!(transport.open_attempts(&orders()), 1);
    advance(1_000).await;
    assert_eq!(transport.open_attempts(&orders()), 2);
    advance(2_000).await;
    assert_eq!(transport.open_attempts(&orders()), 3);
    advance(4_000).await;
    assert_eq!(transport.open_attempts(&orders()), 4);
    advance(8_000).await;
    assert_eq!(transport.open_attempts(&orders()), 5);

    let status = engine.subscription_status(&orders()).unwrap();
    assert!(status.permanently_failed);
    assert_eq!(status.state, SubscriptionState::Error);
    assert_eq!(status.retry_count, 5);
    assert_eq!(status.last_error.as_deref(), Some("open failed: connection refused"));

    {
        let seen = seen.lock().unwrap();
        assert!(matches!(
            seen.last(),
            Some(SyncNotification::SubscriptionFailed { attempts: 5, .. })
        ));
    }

    // No further attempts
    advance(60_000).await;
    assert_eq!(transport.open_attempts(&orders()), 5);
}

/// Transient failures recover and reset the retry count.
#[tokio::test(start_paused = true)]
async fn transient_failure_recovers() {
    let (engine, transport) = engine(quiet_config());
    transport.fail_next_open("dns");
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();

    advance(1).await;
    let status = engine.subscription_status(&orders()).unwrap();
    assert_eq!(status.state, SubscriptionState::Error);
    assert_eq!(status.retry_count, 1);

    advance(1_000).await;
    let status = engine.subscription_status(&orders()).unwrap();
    assert_eq!(status.state, SubscriptionState::Connected);
    assert_eq!(status.retry_count, 0);
    assert!(status.last_connected_ms.is_some());
}

/// A dropped stream counts as a failure and is retried.
#[tokio::test(start_paused = true)]
async fn severed_channel_reconnects() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    assert_eq!(transport.sever(&orders()), 1);
    advance(1).await;
    assert_eq!(
        engine.subscription_status(&orders()).unwrap().state,
        SubscriptionState::Error
    );

    advance(1_000).await;
    assert_eq!(transport.open_channels(&orders()), 1);
    assert_eq!(
        engine.subscription_status(&orders()).unwrap().state,
        SubscriptionState::Connected
    );
}

/// Timed-out channels back off with non-decreasing delays up to the cap.
#[tokio::test(start_paused = true)]
async fn backoff_delays_never_decrease() {
    let policy = RetryPolicy::new(10, Duration::from_millis(100), 3.0)
        .with_max_delay(Duration::from_millis(1_000));
    let (engine, transport) = engine(quiet_config().with_retry(policy));
    transport.fail_all_opens("timeout");
    let _handle = engine
        .subscribe(engine.config().subscription("orders"), |_| {})
        .unwrap();

    // Delays 100, 300, 900, 1000, 1000 ms
    let mut attempt_times = Vec::new();
    let mut last = transport.open_attempts(&orders());
    for ms in 1..=4_000u64 {
        advance(1).await;
        let attempts = transport.open_attempts(&orders());
        if attempts != last {
            attempt_times.push(ms);
            last = attempts;
        }
    }

    let gaps: Vec<u64> = attempt_times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.len() >= 3);
    assert!(gaps.windows(2).all(|g| g[1] >= g[0]));
    assert!(gaps.iter().all(|&g| g <= 1_001));
}

/// Unsubscribing the last listener releases the channel at once.
#[tokio::test(start_paused = true)]
async fn unsubscribe_releases_channel() {
    let (engine, transport) = engine(quiet_config());
    let first = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    let second = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;
    assert_eq!(transport.open_attempts(&orders()), 1);

    first.unsubscribe();
    assert!(engine.is_subscribed(&orders()));

    second.unsubscribe();
    assert!(!engine.is_subscribed(&orders()));
    assert_eq!(engine.active_subscriptions(), 0);

    advance(1).await;
    assert_eq!(transport.open_channels(&orders()), 0);

    // Later events on the topic go nowhere
    assert_eq!(transport.emit(&orders(), order_update("42", "shipped")), 0);
}

/// Unsubscribing during backoff cancels the pending reconnect.
#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_reconnect() {
    let (engine, transport) = engine(quiet_config());
    transport.fail_next_open("refused");
    let handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    handle.unsubscribe();
    advance(5_000).await;

    assert_eq!(transport.open_attempts(&orders()), 1);
}

/// A channel confirmed only after a delay moves through connecting to connected.
#[tokio::test(start_paused = true)]
async fn manual_channel_waits_for_confirmation() {
    let transport = MockTransport::manual();
    let engine = SyncEngine::new(quiet_config(), transport.clone(), InMemoryCache::new()).unwrap();
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    assert_eq!(
        engine.subscription_status(&orders()).unwrap().state,
        SubscriptionState::Connecting
    );
    transport.send_status(&orders(), ChannelStatus::Subscribed);
    advance(1).await;
    assert_eq!(
        engine.subscription_status(&orders()).unwrap().state,
        SubscriptionState::Connected
    );
}

// ============================================================================
// Health and refresh
// ============================================================================

/// Two failing intervals in a row force every subscription to reconnect,
/// even one that had given up.
#[tokio::test(start_paused = true)]
async fn health_monitor_revives_failed_subscriptions() {
    let config = EngineConfig::default()
        .with_health_interval(Duration::from_secs(10))
        .with_failure_threshold(2);
    let (engine, transport) = engine(config);
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;

    transport.fail_all_opens("down");
    transport.sever(&orders());

    // Failures at t=0, 1, 3, 7; first check at t=10
    advance(10_500).await;
    let health = engine.status().health;
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(health.forced_reconnects, 0);

    // Last failure at t=15 exhausts the budget
    advance(5_000).await;
    assert!(engine.subscription_status(&orders()).unwrap().permanently_failed);

    transport.stop_failing();
    advance(5_000).await;

    let status = engine.status();
    assert_eq!(status.health.forced_reconnects, 1);
    assert!(status.health.healthy);
    let orders_status = &status.subscriptions[0];
    assert_eq!(orders_status.state, SubscriptionState::Connected);
    assert!(!orders_status.permanently_failed);
    assert_eq!(transport.open_attempts(&orders()), 6);
}

/// force_refresh drops the cache and pending writes and re-subscribes.
#[tokio::test(start_paused = true)]
async fn force_refresh_resets_state() {
    let (engine, transport) = engine(quiet_config());
    let _handle = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    advance(1).await;
    transport.emit(&orders(), order_update("1", "shipped"));
    advance(1).await;

    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::update("orders", "1", json!({"v": 2}), json!({"v": 1})),
            None,
        )
        .unwrap();

    engine.force_refresh().unwrap();
    assert!(matches!(pending.outcome().await, Err(EngineError::Reset)));
    advance(1).await;

    assert!(engine.cache().is_empty());
    assert_eq!(engine.status().pending_updates, 0);
    assert_eq!(transport.open_attempts(&orders()), 2);
    assert_eq!(transport.open_channels(&orders()), 1);

    // Nothing left to time out
    advance(6_000).await;
    assert!(engine.cache().is_empty());
}

/// Shutdown closes channels and resolves pending writes.
#[tokio::test(start_paused = true)]
async fn shutdown_is_clean() {
    let (engine, transport) = engine(quiet_config());
    let _a = engine.subscribe(SubscriptionConfig::new("orders"), |_| {}).unwrap();
    let _b = engine.subscribe(SubscriptionConfig::new("users"), |_| {}).unwrap();
    advance(1).await;
    let pending = engine
        .perform_optimistic_update(
            SpeculativeWrite::create("orders", "1", json!({"id": "1"})),
            None,
        )
        .unwrap();

    engine.shutdown().await.unwrap();

    assert!(matches!(pending.outcome().await, Err(EngineError::Shutdown)));
    assert_eq!(transport.closed_channels().len(), 2);
    assert!(matches!(
        engine.perform_optimistic_update(SpeculativeWrite::create("orders", "2", json!({})), None),
        Err(EngineError::Shutdown)
    ));
    assert!(matches!(engine.force_refresh(), Err(EngineError::Shutdown)));
}
