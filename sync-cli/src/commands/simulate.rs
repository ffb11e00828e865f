//! Drive the engine against the mock transport.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use sync_client::{
    confirm_with, Cache, ChangeEvent, ConfirmError, EngineConfig, EntityId, EventKind,
    InMemoryCache, MockTransport, SpeculativeWrite, SubscriptionState, SyncEngine,
    SyncNotification, Topic, UpdateOutcome,
};
use tracing::{info, warn};

/// How often the connection state is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Simulated server round trip for the optimistic write.
const CONFIRM_LATENCY: Duration = Duration::from_millis(200);

/// Options for the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Topic to subscribe to.
    pub topic: String,
    /// Remote events to emit.
    pub events: u32,
    /// Open attempts that fail before the transport recovers.
    pub fail_opens: u32,
    /// Reject the optimistic write.
    pub reject: bool,
}

/// Run the simulate command.
pub async fn run(config: EngineConfig, options: SimulateOptions) -> Result<()> {
    let transport = MockTransport::new();
    if options.fail_opens > 0 {
        transport.fail_all_opens("simulated outage");
    }

    let engine = SyncEngine::new(config.clone(), transport.clone(), InMemoryCache::new())
        .context("Failed to start sync engine")?;
    let topic = Topic::new(options.topic.as_str());
    info!(
        topic = %topic,
        events = options.events,
        fail_opens = options.fail_opens,
        reject = options.reject,
        "starting simulation"
    );

    println!("=== rtsync simulate ===");
    println!();
    println!("Topic: {}", topic);

    let subscription = engine
        .subscribe(config.subscription(topic.clone()), print_notification)
        .context("Failed to subscribe")?;

    // Wait for the channel, lifting the outage after the requested failures
    let connected = loop {
        if transport.open_attempts(&topic) >= options.fail_opens as usize {
            transport.stop_failing();
        }
        match engine.subscription_status(&topic) {
            Some(status) if status.state == SubscriptionState::Connected => break true,
            Some(status) if status.permanently_failed => break false,
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    };

    if !connected {
        warn!(topic = %topic, "subscription gave up");
        println!();
        println!("Subscription failed permanently.");
        print_status(&engine)?;
        engine.shutdown().await?;
        anyhow::bail!("subscription to {} gave up after retries", topic);
    }
    println!(
        "Connected after {} attempt(s)",
        transport.open_attempts(&topic)
    );
    println!();

    // Remote traffic
    for i in 1..=options.events {
        let record = json!({"id": i, "status": "pending"});
        transport.emit(
            &topic,
            ChangeEvent::remote(EventKind::Create, topic.clone(), None, Some(record)),
        );
    }
    settle(&config).await;
    println!(
        "Cached entities: {}",
        engine.cache().collection_len(&topic)
    );

    // One optimistic write on the first entity
    let entity_id = EntityId::new("1");
    let rollback = engine
        .cache()
        .get(&topic, &entity_id)
        .unwrap_or_else(|| json!({"id": 1, "status": "pending"}));
    let proposed = json!({"id": 1, "status": "shipped"});
    let confirm = confirm_server_write(proposed.clone(), options.reject);

    let handle = engine.perform_optimistic_update(
        SpeculativeWrite::update(topic.clone(), entity_id.clone(), proposed, rollback),
        Some(confirm),
    )?;
    println!("Optimistic write {} applied", handle.update_id());

    let update_id = handle.update_id();
    match handle.outcome().await {
        Ok(UpdateOutcome::Confirmed { .. }) => {
            info!(update_id = %update_id, "simulated write confirmed");
            println!("Write confirmed");
        }
        Ok(UpdateOutcome::Superseded) => {
            info!(update_id = %update_id, "simulated write superseded");
            println!("Write superseded");
        }
        Err(e) => {
            warn!(update_id = %update_id, error = %e, "simulated write failed");
            println!("Write failed: {}", e);
        }
    }
    settle(&config).await;
    println!(
        "Entity 1 now: {}",
        engine
            .cache()
            .get(&topic, &entity_id)
            .unwrap_or(Value::Null)
    );

    println!();
    print_status(&engine)?;

    subscription.unsubscribe();
    engine.shutdown().await?;
    Ok(())
}

/// Pretend server write that answers after a round trip.
fn confirm_server_write(value: Value, reject: bool) -> sync_client::ConfirmFuture {
    confirm_with(async move {
        tokio::time::sleep(CONFIRM_LATENCY).await;
        if reject {
            Err(ConfirmError::from("rejected by server"))
        } else {
            Ok(value)
        }
    })
}

/// Wait out the debounce window so listeners have run.
async fn settle(config: &EngineConfig) {
    tokio::time::sleep(config.dispatcher.debounce() + POLL_INTERVAL).await;
}

fn print_notification(notification: &SyncNotification) {
    match notification {
        SyncNotification::Change(event) => {
            let id = event
                .entity_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!("  [change]   {} {} ({:?})", event.kind.as_str(), id, event.origin);
        }
        SyncNotification::RolledBack {
            entity_id, reason, ..
        } => {
            println!("  [rollback] {} ({})", entity_id, reason);
        }
        SyncNotification::SubscriptionFailed {
            attempts, error, ..
        } => {
            println!("  [failed]   after {} attempts: {}", attempts, error);
        }
    }
}

fn print_status(engine: &SyncEngine<MockTransport, InMemoryCache>) -> Result<()> {
    let status = serde_json::to_string_pretty(&engine.status())?;
    println!("Status:");
    println!("{}", status);
    Ok(())
}
