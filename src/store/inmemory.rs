use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::store::{
    ClaimMessages, DeadLetterFilter, DeadLetterPage, DeadLetterStore, EnqueueMessages,
    FailureAction, RecordOutcomes, ResetOutcome,
};
use crate::{Event, OutboxMessage};

/// An in-memory outbox store for testing or local usage.
///
/// Keeps messages in a `BTreeMap` behind a single async mutex, which makes
/// every claim and state update atomic: of two concurrent claims over the
/// same message, exactly one wins, matching the backend contract.
///
/// There is no real transaction here, so `Transaction<'_> = ()` and the
/// enqueue-if-and-only-if-committed guarantee is the caller's concern; the
/// SQLx backend provides it for production.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, OutboxMessage<i64>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store stamping `occurred_on` from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping `occurred_on` from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                rows: BTreeMap::new(),
            })),
            clock,
        }
    }

    /// Fetch a snapshot of one message, if it exists.
    pub async fn message(&self, id: i64) -> Option<OutboxMessage<i64>> {
        self.inner.lock().await.rows.get(&id).cloned()
    }

    /// Number of messages in the store, regardless of state.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    /// Whether the store holds no messages at all.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.rows.is_empty()
    }
}

#[async_trait]
impl EnqueueMessages for InMemoryStore {
    type Error = Infallible;
    type ID = i64;
    type Transaction<'a> = ();

    async fn enqueue_messages(
        &self,
        events: Vec<Event>,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        for event in events {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.rows.insert(id, OutboxMessage::enqueued(id, event, now));
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimMessages for InMemoryStore {
    type Error = Infallible;
    type ID = i64;

    async fn claim_messages(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage<Self::ID>>, Self::Error> {
        let leased_until = crate::clock::saturating_after(now, lease);
        let mut inner = self.inner.lock().await;

        let mut due: Vec<i64> = inner
            .rows
            .values()
            .filter(|m| {
                m.processed_on.is_none() && m.dead_lettered_on.is_none() && m.next_attempt_on <= now
            })
            .map(|m| m.id)
            .collect();
        due.sort_by_key(|id| inner.rows[id].occurred_on);
        due.truncate(batch_size);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let row = inner.rows.get_mut(&id).expect("due id present");
            // The lease excludes the row from other claimers until it
            // expires or an outcome is recorded.
            row.next_attempt_on = leased_until;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }
}

#[async_trait]
impl RecordOutcomes for InMemoryStore {
    type Error = Infallible;
    type ID = i64;

    async fn mark_processed(
        &self,
        id: &Self::ID,
        processed_on: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.get_mut(id) {
            if row.processed_on.is_none() && row.dead_lettered_on.is_none() {
                row.processed_on = Some(processed_on);
                row.error = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &Self::ID,
        error: &str,
        action: FailureAction,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.get_mut(id) {
            if row.processed_on.is_none() && row.dead_lettered_on.is_none() {
                row.retry_count += 1;
                row.error = Some(error.to_owned());
                match action {
                    FailureAction::Retry { next_attempt_on } => {
                        row.next_attempt_on = next_attempt_on;
                    }
                    FailureAction::DeadLetter { dead_lettered_on } => {
                        row.dead_lettered_on = Some(dead_lettered_on);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    type Error = Infallible;
    type ID = i64;

    async fn list_dead_letters(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<DeadLetterPage<Self::ID>, Self::Error> {
        let inner = self.inner.lock().await;
        let mut dead: Vec<&OutboxMessage<i64>> = inner
            .rows
            .values()
            .filter(|m| m.dead_lettered_on.is_some())
            .collect();
        dead.sort_by(|a, b| {
            b.dead_lettered_on
                .cmp(&a.dead_lettered_on)
                .then(b.occurred_on.cmp(&a.occurred_on))
        });

        let total_count = dead.len() as u64;
        let items = dead
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(DeadLetterPage { items, total_count })
    }

    async fn reset_dead_letter(
        &self,
        id: &Self::ID,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<ResetOutcome, Self::Error> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.rows.get_mut(id) else {
            return Ok(ResetOutcome::NotFound);
        };
        if row.dead_lettered_on.is_none() {
            return Ok(ResetOutcome::NotDeadLettered);
        }
        reset_row(row, next_attempt_on);
        Ok(ResetOutcome::Reset)
    }

    async fn reset_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        max_items: u32,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock().await;

        let mut matching: Vec<i64> = inner
            .rows
            .values()
            .filter(|m| matches_filter(m, filter))
            .map(|m| m.id)
            .collect();
        matching.sort_by_key(|id| inner.rows[id].dead_lettered_on);
        matching.truncate(max_items as usize);

        let reset = matching.len() as u64;
        for id in matching {
            let row = inner.rows.get_mut(&id).expect("matching id present");
            reset_row(row, next_attempt_on);
        }
        Ok(reset)
    }
}

fn matches_filter(msg: &OutboxMessage<i64>, filter: &DeadLetterFilter) -> bool {
    let Some(dead_lettered_on) = msg.dead_lettered_on else {
        return false;
    };
    if let Some(needle) = &filter.event_type_contains {
        if !msg.event.event_type.contains(needle.as_str()) {
            return false;
        }
    }
    if let Some(from) = filter.dead_lettered_from {
        if dead_lettered_on < from {
            return false;
        }
    }
    if let Some(to) = filter.dead_lettered_to {
        if dead_lettered_on > to {
            return false;
        }
    }
    true
}

fn reset_row(row: &mut OutboxMessage<i64>, next_attempt_on: DateTime<Utc>) {
    row.retry_count = 0;
    row.dead_lettered_on = None;
    row.processed_on = None;
    row.error = None;
    row.next_attempt_on = next_attempt_on;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn store_with_clock() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    async fn enqueue_one(store: &InMemoryStore, event_type: &str) -> i64 {
        store
            .enqueue_messages(vec![Event::new(event_type, vec![])], &mut ())
            .await
            .unwrap();
        store.len().await as i64
    }

    #[tokio::test]
    async fn claims_oldest_first_and_respects_batch_size() {
        let (store, clock) = store_with_clock().await;
        for i in 0..3 {
            clock.advance(Duration::from_secs(1));
            enqueue_one(&store, &format!("event.{i}")).await;
        }
        clock.advance(Duration::from_secs(1));

        let claimed = store
            .claim_messages(clock.now(), 2, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].event().event_type, "event.0");
        assert_eq!(claimed[1].event().event_type, "event.1");
    }

    #[tokio::test]
    async fn lease_excludes_claimed_messages_until_expiry() {
        let (store, clock) = store_with_clock().await;
        enqueue_one(&store, "mission.updated").await;

        let first = store
            .claim_messages(clock.now(), 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Second claim at the same instant loses.
        let second = store
            .claim_messages(clock.now(), 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_empty());

        // After the lease expires the message is due again.
        clock.advance(Duration::from_secs(31));
        let third = store
            .claim_messages(clock.now(), 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn oversized_lease_is_clamped_not_a_panic() {
        let (store, clock) = store_with_clock().await;
        enqueue_one(&store, "mission.updated").await;

        let claimed = store
            .claim_messages(clock.now(), 10, Duration::MAX)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // The claim effectively never expires.
        clock.advance(Duration::from_secs(u32::MAX as u64));
        assert!(store
            .claim_messages(clock.now(), 10, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_over_one_message_have_one_winner() {
        let (store, clock) = store_with_clock().await;
        enqueue_one(&store, "mission.updated").await;
        let now = clock.now();

        let a = store.claim_messages(now, 10, Duration::from_secs(30));
        let b = store.claim_messages(now, 10, Duration::from_secs(30));
        let (a, b) = tokio::join!(a, b);

        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn mark_failed_schedules_retry_then_dead_letters() {
        let (store, clock) = store_with_clock().await;
        let id = enqueue_one(&store, "metric.checked-in").await;

        let retry_at = clock.now() + chrono::Duration::seconds(10);
        store
            .mark_failed(
                &id,
                "recipient lookup timed out",
                FailureAction::Retry {
                    next_attempt_on: retry_at,
                },
            )
            .await
            .unwrap();

        let row = store.message(id).await.unwrap();
        assert_eq!(row.retry_count(), 1);
        assert_eq!(row.error(), Some("recipient lookup timed out"));
        assert_eq!(row.next_attempt_on(), retry_at);
        assert_eq!(row.state(), crate::MessageState::Active);

        store
            .mark_failed(
                &id,
                "recipient lookup timed out",
                FailureAction::DeadLetter {
                    dead_lettered_on: clock.now(),
                },
            )
            .await
            .unwrap();

        let row = store.message(id).await.unwrap();
        assert_eq!(row.retry_count(), 2);
        assert_eq!(row.state(), crate::MessageState::DeadLettered);
    }

    #[tokio::test]
    async fn outcomes_do_not_touch_terminal_messages() {
        let (store, clock) = store_with_clock().await;
        let id = enqueue_one(&store, "mission.created").await;

        store.mark_processed(&id, clock.now()).await.unwrap();
        store
            .mark_failed(
                &id,
                "late failure",
                FailureAction::Retry {
                    next_attempt_on: clock.now(),
                },
            )
            .await
            .unwrap();

        let row = store.message(id).await.unwrap();
        assert_eq!(row.state(), crate::MessageState::Processed);
        assert_eq!(row.retry_count(), 0);
        assert!(row.error().is_none());
    }

    #[tokio::test]
    async fn reset_distinguishes_missing_and_live_messages() {
        let (store, clock) = store_with_clock().await;
        let live = enqueue_one(&store, "mission.updated").await;

        assert_eq!(
            store.reset_dead_letter(&999, clock.now()).await.unwrap(),
            ResetOutcome::NotFound
        );
        assert_eq!(
            store.reset_dead_letter(&live, clock.now()).await.unwrap(),
            ResetOutcome::NotDeadLettered
        );
        // The live message is untouched.
        let row = store.message(live).await.unwrap();
        assert_eq!(row.retry_count(), 0);
        assert_eq!(row.state(), crate::MessageState::Active);
    }

    #[tokio::test]
    async fn reset_returns_a_dead_letter_to_the_pipeline() {
        let (store, clock) = store_with_clock().await;
        let id = enqueue_one(&store, "mission.updated").await;
        store
            .mark_failed(
                &id,
                "boom",
                FailureAction::DeadLetter {
                    dead_lettered_on: clock.now(),
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        let now = clock.now();
        assert_eq!(
            store.reset_dead_letter(&id, now).await.unwrap(),
            ResetOutcome::Reset
        );

        let row = store.message(id).await.unwrap();
        assert_eq!(row.retry_count(), 0);
        assert!(row.error().is_none());
        assert!(row.dead_lettered_on().is_none());
        assert_eq!(row.next_attempt_on(), now);

        // Immediately claimable again.
        let claimed = store
            .claim_messages(now, 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn bulk_reset_filters_and_takes_oldest_first() {
        let (store, clock) = store_with_clock().await;

        // Three mission dead letters at increasing times, one metric.
        for _ in 0..3 {
            let id = enqueue_one(&store, "mission.updated").await;
            clock.advance(Duration::from_secs(10));
            store
                .mark_failed(
                    &id,
                    "boom",
                    FailureAction::DeadLetter {
                        dead_lettered_on: clock.now(),
                    },
                )
                .await
                .unwrap();
        }
        let metric = enqueue_one(&store, "metric.checked-in").await;
        store
            .mark_failed(
                &metric,
                "boom",
                FailureAction::DeadLetter {
                    dead_lettered_on: clock.now(),
                },
            )
            .await
            .unwrap();

        let filter = DeadLetterFilter {
            event_type_contains: Some("mission".to_owned()),
            ..Default::default()
        };
        let reset = store
            .reset_dead_letters(&filter, 2, clock.now())
            .await
            .unwrap();
        assert_eq!(reset, 2);

        // The two oldest mission dead letters were reset; the newest mission
        // one and the metric one remain.
        assert_eq!(store.message(1).await.unwrap().dead_lettered_on(), None);
        assert_eq!(store.message(2).await.unwrap().dead_lettered_on(), None);
        assert!(store.message(3).await.unwrap().dead_lettered_on().is_some());
        assert!(store
            .message(metric)
            .await
            .unwrap()
            .dead_lettered_on()
            .is_some());
    }

    #[tokio::test]
    async fn listing_orders_most_recent_dead_letter_first() {
        let (store, clock) = store_with_clock().await;
        for _ in 0..3 {
            let id = enqueue_one(&store, "mission.updated").await;
            clock.advance(Duration::from_secs(5));
            store
                .mark_failed(
                    &id,
                    "boom",
                    FailureAction::DeadLetter {
                        dead_lettered_on: clock.now(),
                    },
                )
                .await
                .unwrap();
        }

        let page = store.list_dead_letters(0, 2).await.unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(*page.items[0].id(), 3);
        assert_eq!(*page.items[1].id(), 2);

        let rest = store.list_dead_letters(2, 2).await.unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(*rest.items[0].id(), 1);
    }
}
