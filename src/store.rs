//! Outbox store abstractions and backend drivers.
//!
//! The store is the single source of truth for delivery state. It persists
//! messages atomically with application state, hands due messages to the
//! dispatcher under an exclusive claim, and records attempt outcomes as
//! single-row conditional updates.
//!
//! ## Responsibilities
//!
//! - Persist messages in the same transaction as the triggering state change
//! - Claim due messages exclusively for one dispatcher instance
//! - Record success, retry scheduling, and dead-lettering
//! - Serve dead-letter listings and administrative resets
//!
//! ## Components
//!
//! - [`Enqueuer`]: High-level façade over a store backend for producers
//! - [`EnqueueMessages`]: Trait for transactional insertion
//! - [`ClaimMessages`]: Trait for lease-based claiming
//! - [`RecordOutcomes`]: Trait for recording attempt outcomes
//! - [`DeadLetterStore`]: Trait for dead-letter queries and resets
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{Event, OutboxMessage};

/// Error returned by store operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl StoreError {
    /// Create a backend-related store error.
    pub(crate) fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// What the store should do with a message after a failed attempt.
///
/// Either way the store increments `retry_count` and overwrites `error`;
/// the dispatcher computes the timestamps from its clock so backends stay
/// clock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Schedule another attempt no earlier than `next_attempt_on`.
    Retry { next_attempt_on: DateTime<Utc> },
    /// Give up: exclude the message from claims until an operator resets it.
    DeadLetter { dead_lettered_on: DateTime<Utc> },
}

/// Result of a single administrative reset attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The message was dead-lettered and is now active again.
    Reset,
    /// No message with the given id exists.
    NotFound,
    /// The message exists but is not currently dead-lettered.
    NotDeadLettered,
}

/// Filter for bulk dead-letter resets.
///
/// All criteria are optional and combined with AND; an empty filter matches
/// every dead-lettered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    /// Substring match against `event_type`.
    pub event_type_contains: Option<String>,
    /// Inclusive lower bound on `dead_lettered_on`.
    pub dead_lettered_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `dead_lettered_on`.
    pub dead_lettered_to: Option<DateTime<Utc>>,
}

/// One page of dead-lettered messages, most recently dead-lettered first.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPage<ID> {
    /// Messages on this page.
    pub items: Vec<OutboxMessage<ID>>,
    /// Total number of dead-lettered messages across all pages.
    pub total_count: u64,
}

/// High-level façade over a store backend for producers.
///
/// `Enqueuer` provides a stable, ergonomic API for appending outbox rows
/// while delegating persistence to the underlying backend.
pub struct Enqueuer<D>(D);

impl<D> Enqueuer<D>
where
    D: Clone,
{
    /// Create a new enqueuer backed by the given store backend.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Append events to the outbox.
    ///
    /// Rows are inserted into the outbox but **not** delivered immediately;
    /// delivery is handled asynchronously by a dispatcher.
    ///
    /// This method must be called within the same transaction that mutates
    /// application state: if the enclosing transaction rolls back, the rows
    /// must not exist. Insert failure is a hard error for the caller, since
    /// committing the state change without its events would silently drop
    /// downstream effects.
    #[instrument(skip(self, events, tx))]
    pub async fn enqueue(
        &self,
        events: impl IntoIterator<Item = impl Into<Event>>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), StoreError>
    where
        D: EnqueueMessages,
        <D as EnqueueMessages>::Error: Into<tower::BoxError>,
    {
        let events: Vec<Event> = events.into_iter().map(Into::into).collect();

        self.0
            .enqueue_messages(events, tx)
            .await
            .map_err(|e| StoreError::backend(e.into()))
    }
}

/// Trait for inserting messages into the outbox.
///
/// Implementations must ensure durability and transactional guarantees:
/// rows become visible if and only if the caller's transaction commits.
/// New rows are active with `retry_count = 0` and
/// `next_attempt_on = occurred_on = now`.
#[async_trait::async_trait]
pub trait EnqueueMessages {
    /// Backend-specific error type.
    type Error;
    /// Identifier type assigned to stored messages.
    type ID;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Insert a batch of events into the outbox within `tx`.
    async fn enqueue_messages(
        &self,
        events: Vec<Event>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for claiming due messages for delivery.
///
/// A message is due when it is active (neither processed nor dead-lettered)
/// and `next_attempt_on <= now`. Claiming must be exclusive under concurrent
/// dispatcher instances: of two simultaneous claims over the same row,
/// exactly one wins and the loser skips the row this cycle.
#[async_trait::async_trait]
pub trait ClaimMessages {
    /// Backend-specific error type.
    type Error;
    /// Identifier type for stored messages.
    type ID;

    /// Claim up to `batch_size` due messages, oldest `occurred_on` first.
    ///
    /// The claim holds for `lease`: the backend pushes `next_attempt_on` to
    /// `now + lease` in the same conditional update that selects the rows,
    /// so an instance that crashes mid-batch loses its claim when the lease
    /// expires and the messages become due again.
    async fn claim_messages(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage<Self::ID>>, Self::Error>;
}

/// Trait for recording the outcome of a delivery attempt.
#[async_trait::async_trait]
pub trait RecordOutcomes {
    /// Backend-specific error type.
    type Error;
    /// Identifier type for stored messages.
    type ID;

    /// Record a successful attempt: set `processed_on`, clear `error`.
    async fn mark_processed(
        &self,
        id: &Self::ID,
        processed_on: DateTime<Utc>,
    ) -> Result<(), Self::Error>;

    /// Record a failed attempt: increment `retry_count`, overwrite `error`,
    /// and apply the policy's [`FailureAction`].
    async fn mark_failed(
        &self,
        id: &Self::ID,
        error: &str,
        action: FailureAction,
    ) -> Result<(), Self::Error>;
}

/// Trait for dead-letter queries and administrative resets.
#[async_trait::async_trait]
pub trait DeadLetterStore {
    /// Backend-specific error type.
    type Error;
    /// Identifier type for stored messages.
    type ID;

    /// List dead-lettered messages ordered by `dead_lettered_on` descending
    /// then `occurred_on` descending, skipping `offset` rows and returning
    /// at most `limit`.
    async fn list_dead_letters(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<DeadLetterPage<Self::ID>, Self::Error>;

    /// Reset one dead-lettered message back into the active pipeline:
    /// `retry_count = 0`, terminal timestamps and `error` cleared,
    /// `next_attempt_on = next_attempt_on` argument (typically now).
    ///
    /// Distinguishes a missing message from one that exists but is not
    /// dead-lettered; neither case mutates anything.
    async fn reset_dead_letter(
        &self,
        id: &Self::ID,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<ResetOutcome, Self::Error>;

    /// Reset up to `max_items` dead-lettered messages matching `filter`,
    /// oldest `dead_lettered_on` first. Returns the number actually reset.
    async fn reset_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        max_items: u32,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<u64, Self::Error>;
}
