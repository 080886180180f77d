//! Dispatcher loop moving outbox messages through attempt → outcome.
//!
//! This module implements the background *dispatcher* that:
//!
//! - Claims bounded batches of due messages from the store
//! - Resolves a handler for each message by event type
//! - Invokes the handler and records success, retry, or dead-letter
//! - Exposes lifecycle hooks for observability and customization
//!
//! Handler failures never escape the loop: they are recorded on the message
//! and turned into a [`RetryPolicy`] decision. A failure to update the store
//! itself is fatal for that cycle only — it is reported through the hook and
//! the loop resumes on the next tick, without the message's `retry_count`
//! having advanced.
//!
//! Multiple dispatcher instances may run against the same store; claim
//! exclusivity is the store's contract. Shutdown is cooperative via a
//! [`CancellationToken`]: the in-flight batch is finished, then the loop
//! stops claiming.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::retry::{Decision, RetryPolicy};
use crate::store::{ClaimMessages, FailureAction, RecordOutcomes, StoreError};
use crate::{HandlerRegistry, OutboxMessage};

/// Background dispatcher for outbox messages.
///
/// Generic parameters:
/// - `D`: Store backend (claim + outcome recording)
/// - `HK`: Hook implementation for lifecycle events
pub struct Dispatcher<D, HK = DefaultDispatcherHook>
where
    D: ClaimMessages,
{
    store: D,
    registry: HandlerRegistry,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    hook: HK,
    poll_interval: Duration,
    batch_size: usize,
    claim_lease: Duration,
}

impl<D> Dispatcher<D, DefaultDispatcherHook>
where
    D: ClaimMessages,
{
    /// Create a dispatcher with the default hook and default cadence:
    /// 5s poll interval, batches of 100, 30s claim lease.
    pub fn new(
        store: D,
        registry: HandlerRegistry,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            clock,
            hook: DefaultDispatcherHook,
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl<D, HK> Dispatcher<D, HK>
where
    D: ClaimMessages,
{
    /// Sets the pause between claim cycles.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum number of messages claimed per cycle.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the claim lease duration.
    ///
    /// The lease must exceed the worst-case handler latency: a message whose
    /// lease expires mid-handling becomes claimable again and will be
    /// delivered a second time (at-least-once).
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Replace the hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics) without
    /// rebuilding the dispatcher.
    pub fn with_hook<HK2>(self, hook: HK2) -> Dispatcher<D, HK2> {
        Dispatcher {
            store: self.store,
            registry: self.registry,
            policy: self.policy,
            clock: self.clock,
            hook,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            claim_lease: self.claim_lease,
        }
    }
}

impl<D, HK> Dispatcher<D, HK>
where
    D: ClaimMessages + RecordOutcomes<ID = <D as ClaimMessages>::ID> + Send + Sync,
    <D as ClaimMessages>::Error: Into<tower::BoxError>,
    <D as RecordOutcomes>::Error: Into<tower::BoxError>,
    <D as ClaimMessages>::ID: Send + Sync,
    HK: DispatcherHook<<D as ClaimMessages>::ID>,
{
    /// Run the dispatcher loop until cancelled.
    ///
    /// Each tick claims a batch and processes it to completion; cancellation
    /// is only observed between cycles, so an in-flight batch always records
    /// its outcomes before the loop stops.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.run_cycle().await {
                self.hook.on_store_error(&err);
            }
        }
    }

    /// Execute one claim-process-record cycle.
    ///
    /// Returns the number of messages claimed. Store failures abort the
    /// remainder of the cycle; messages left with an unexpired lease simply
    /// become due again once it lapses.
    pub async fn run_cycle(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_messages(now, self.batch_size, self.claim_lease)
            .await
            .map_err(|e| StoreError::backend(e.into()))?;

        let claimed = batch.len();
        for message in batch {
            self.process(message).await?;
        }
        Ok(claimed)
    }

    async fn process(
        &self,
        message: OutboxMessage<<D as ClaimMessages>::ID>,
    ) -> Result<(), StoreError> {
        self.hook.on_message_claimed(&message);

        let outcome = match self.registry.resolve(&message.event().event_type) {
            Some(handler) => handler.handle(message.event()).await.map_err(Failure::Transient),
            // A missing handler can never succeed on retry.
            None => Err(Failure::Permanent(format!(
                "no handler registered for event type {:?}",
                message.event().event_type
            ))),
        };

        match outcome {
            Ok(()) => {
                self.store
                    .mark_processed(message.id(), self.clock.now())
                    .await
                    .map_err(|e| StoreError::backend(e.into()))?;
                self.hook.on_message_processed(&message);
            }
            Err(failure) => self.record_failure(&message, failure).await?,
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        message: &OutboxMessage<<D as ClaimMessages>::ID>,
        failure: Failure,
    ) -> Result<(), StoreError> {
        let attempts = message.retry_count() + 1;
        let (error, decision) = match failure {
            Failure::Transient(err) => (err.to_string(), self.policy.decide(attempts)),
            Failure::Permanent(desc) => (desc, Decision::DeadLetter),
        };

        let now = self.clock.now();
        let action = match decision {
            Decision::Retry(delay) => FailureAction::Retry {
                next_attempt_on: crate::clock::saturating_after(now, delay),
            },
            Decision::DeadLetter => FailureAction::DeadLetter {
                dead_lettered_on: now,
            },
        };

        self.store
            .mark_failed(message.id(), &error, action)
            .await
            .map_err(|e| StoreError::backend(e.into()))?;

        match action {
            FailureAction::Retry { next_attempt_on } => {
                self.hook.on_message_failed(message, &error, next_attempt_on);
            }
            FailureAction::DeadLetter { .. } => {
                self.hook.on_message_dead_lettered(message, &error);
            }
        }
        Ok(())
    }
}

enum Failure {
    /// Handler error, retried per policy.
    Transient(tower::BoxError),
    /// Will never succeed; dead-lettered without retry.
    Permanent(String),
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait DispatcherHook<ID>: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_message_claimed(&self, message: &OutboxMessage<ID>);
    fn on_message_processed(&self, message: &OutboxMessage<ID>);
    fn on_message_failed(
        &self,
        message: &OutboxMessage<ID>,
        error: &str,
        next_attempt_on: DateTime<Utc>,
    );
    fn on_message_dead_lettered(&self, message: &OutboxMessage<ID>, error: &str);
    fn on_store_error(&self, error: &dyn std::error::Error);
}

/// Default dispatcher hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDispatcherHook;

impl<ID> DispatcherHook<ID> for DefaultDispatcherHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_message_claimed(&self, message: &OutboxMessage<ID>) {
        tracing::debug!(event_type = %message.event().event_type, "Message claimed");
    }

    fn on_message_processed(&self, message: &OutboxMessage<ID>) {
        tracing::info!(event_type = %message.event().event_type, "Message processed");
    }

    fn on_message_failed(
        &self,
        message: &OutboxMessage<ID>,
        error: &str,
        next_attempt_on: DateTime<Utc>,
    ) {
        tracing::warn!(
            event_type = %message.event().event_type,
            retry_count = message.retry_count() + 1,
            %next_attempt_on,
            error,
            "Message attempt failed, retry scheduled"
        );
    }

    fn on_message_dead_lettered(&self, message: &OutboxMessage<ID>, error: &str) {
        tracing::error!(
            event_type = %message.event().event_type,
            error,
            "Message dead-lettered"
        );
    }

    fn on_store_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Store error, cycle aborted");
    }
}
