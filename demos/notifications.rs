//! Notification fan-out demo against the in-memory store.
//!
//! Enqueues mission events, runs a dispatcher whose check-in handler always
//! fails, then inspects and bulk-reprocesses the resulting dead letters
//! through the admin service.
//!
//! Run with `cargo run --example notifications`.

use std::sync::Arc;
use std::time::Duration;

use relaybox::clock::SystemClock;
use relaybox::handler::handler_fn;
use relaybox::store::inmemory::InMemoryStore;
use relaybox::{
    BulkReprocessRequest, DeadLetterAdmin, Dispatcher, Enqueuer, Event, HandlerRegistry,
    RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();

    let clock = Arc::new(SystemClock);
    let store = InMemoryStore::new();

    // Producer side: the enqueue shares the unit of work of the business
    // mutation; the in-memory store has no real transaction.
    let enqueuer = Enqueuer::new(store.clone());
    enqueuer
        .enqueue(
            [
                Event::new("mission.updated", br#"{"missionId":"M1"}"#.to_vec()),
                Event::new("metric.checked-in", br#"{"metricId":"K7"}"#.to_vec()),
            ],
            &mut (),
        )
        .await?;

    // Consumer side: mission updates fan out fine, check-ins keep failing
    // until the policy dead-letters them.
    let registry = HandlerRegistry::new()
        .with_handler(
            "mission.updated",
            handler_fn(|event| {
                let payload = String::from_utf8_lossy(&event.payload).into_owned();
                async move {
                    tracing::info!(%payload, "notifying mission collaborators");
                    Ok(())
                }
            }),
        )
        .with_handler(
            "metric.checked-in",
            handler_fn(|_event| async { Err::<(), _>("recipient service is down".into()) }),
        );

    let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1));
    let dispatcher = Dispatcher::new(store.clone(), registry, policy, clock.clone())
        .with_poll_interval(Duration::from_millis(50));

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(dispatcher.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    worker.await?;

    // Operator side: inspect and requeue the dead letters.
    let admin = DeadLetterAdmin::new(store, clock);
    let page = admin.list(1, 50).await?;
    for msg in &page.items {
        tracing::info!(
            id = *msg.id(),
            event_type = %msg.event().event_type,
            retry_count = msg.retry_count(),
            error = msg.error().unwrap_or("-"),
            "dead letter"
        );
    }

    let reset = admin
        .reprocess_bulk(BulkReprocessRequest {
            event_type: Some("metric".to_owned()),
            dead_lettered_from: None,
            dead_lettered_to: None,
            max_items: 50,
        })
        .await?;
    tracing::info!(reset, "dead letters returned to the pipeline");

    Ok(())
}
