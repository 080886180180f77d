use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::store::{
    ClaimMessages, DeadLetterFilter, DeadLetterPage, DeadLetterStore, EnqueueMessages,
    FailureAction, RecordOutcomes, ResetOutcome,
};
use crate::{Event, OutboxMessage};

/// Postgres-backed outbox store.
///
/// All mutation happens through single-row conditional updates; claiming
/// uses `FOR UPDATE SKIP LOCKED` so concurrent dispatcher instances never
/// process the same message twice within a lease.
pub struct PgStore {
    pool: PgPool,
}

impl Clone for PgStore {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl PgStore {
    /// Creates a store without checking that the table exists.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a store and ensures the outbox table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl EnqueueMessages for PgStore {
    type Error = tower::BoxError;
    type ID = i64;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all)]
    async fn enqueue_messages(
        &self,
        events: Vec<Event>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        for event in events {
            // now() is the transaction timestamp, so occurred_on and
            // next_attempt_on start equal and the row is due immediately.
            sqlx::query(
                "INSERT INTO outbox_message (event_type, payload, occurred_on, next_attempt_on)
                 VALUES ($1, $2, now(), now())",
            )
            .bind(&event.event_type)
            .bind(&event.payload)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimMessages for PgStore {
    type Error = tower::BoxError;
    type ID = i64;

    #[tracing::instrument(skip_all, fields(batch_size))]
    async fn claim_messages(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage<Self::ID>>, Self::Error> {
        let leased_until = crate::clock::saturating_after(now, lease);

        // SKIP LOCKED makes the row selection exclusive between concurrent
        // claimers; pushing next_attempt_on forward keeps it exclusive for
        // the duration of the lease even across separate connections.
        let rows = sqlx::query(
            "WITH due AS (
                 SELECT id FROM outbox_message
                 WHERE processed_on IS NULL
                   AND dead_lettered_on IS NULL
                   AND next_attempt_on <= $1
                 ORDER BY occurred_on
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE outbox_message m
             SET next_attempt_on = $3
             FROM due
             WHERE m.id = due.id
             RETURNING m.id, m.event_type, m.payload, m.occurred_on, m.processed_on,
                       m.retry_count, m.next_attempt_on, m.dead_lettered_on, m.error",
        )
        .bind(now)
        .bind(batch_size as i64)
        .bind(leased_until)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        // UPDATE ... RETURNING does not guarantee order.
        claimed.sort_by_key(|m| m.occurred_on);
        Ok(claimed)
    }
}

#[async_trait]
impl RecordOutcomes for PgStore {
    type Error = tower::BoxError;
    type ID = i64;

    #[tracing::instrument(skip_all, fields(id))]
    async fn mark_processed(
        &self,
        id: &Self::ID,
        processed_on: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            "UPDATE outbox_message
             SET processed_on = $2, error = NULL
             WHERE id = $1 AND processed_on IS NULL AND dead_lettered_on IS NULL",
        )
        .bind(id)
        .bind(processed_on)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(id))]
    async fn mark_failed(
        &self,
        id: &Self::ID,
        error: &str,
        action: FailureAction,
    ) -> Result<(), Self::Error> {
        let query = match action {
            FailureAction::Retry { next_attempt_on } => sqlx::query(
                "UPDATE outbox_message
                 SET retry_count = retry_count + 1, error = $2, next_attempt_on = $3
                 WHERE id = $1 AND processed_on IS NULL AND dead_lettered_on IS NULL",
            )
            .bind(id)
            .bind(error)
            .bind(next_attempt_on),
            FailureAction::DeadLetter { dead_lettered_on } => sqlx::query(
                "UPDATE outbox_message
                 SET retry_count = retry_count + 1, error = $2, dead_lettered_on = $3
                 WHERE id = $1 AND processed_on IS NULL AND dead_lettered_on IS NULL",
            )
            .bind(id)
            .bind(error)
            .bind(dead_lettered_on),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for PgStore {
    type Error = tower::BoxError;
    type ID = i64;

    #[tracing::instrument(skip_all)]
    async fn list_dead_letters(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<DeadLetterPage<Self::ID>, Self::Error> {
        let total_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_message WHERE dead_lettered_on IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT id, event_type, payload, occurred_on, processed_on,
                    retry_count, next_attempt_on, dead_lettered_on, error
             FROM outbox_message
             WHERE dead_lettered_on IS NOT NULL
             ORDER BY dead_lettered_on DESC, occurred_on DESC
             OFFSET $1 LIMIT $2",
        )
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(DeadLetterPage {
            items,
            total_count: total_count as u64,
        })
    }

    #[tracing::instrument(skip_all, fields(id))]
    async fn reset_dead_letter(
        &self,
        id: &Self::ID,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<ResetOutcome, Self::Error> {
        let result = sqlx::query(
            "UPDATE outbox_message
             SET retry_count = 0, processed_on = NULL, dead_lettered_on = NULL,
                 error = NULL, next_attempt_on = $2
             WHERE id = $1 AND dead_lettered_on IS NOT NULL",
        )
        .bind(id)
        .bind(next_attempt_on)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ResetOutcome::Reset);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outbox_message WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        Ok(if exists {
            ResetOutcome::NotDeadLettered
        } else {
            ResetOutcome::NotFound
        })
    }

    #[tracing::instrument(skip_all, fields(max_items))]
    async fn reset_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        max_items: u32,
        next_attempt_on: DateTime<Utc>,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(
            "WITH target AS (
                 SELECT id FROM outbox_message
                 WHERE dead_lettered_on IS NOT NULL
                   AND ($1::TEXT IS NULL OR position($1 in event_type) > 0)
                   AND ($2::TIMESTAMPTZ IS NULL OR dead_lettered_on >= $2)
                   AND ($3::TIMESTAMPTZ IS NULL OR dead_lettered_on <= $3)
                 ORDER BY dead_lettered_on
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE outbox_message m
             SET retry_count = 0, processed_on = NULL, dead_lettered_on = NULL,
                 error = NULL, next_attempt_on = $5
             FROM target
             WHERE m.id = target.id",
        )
        .bind(&filter.event_type_contains)
        .bind(filter.dead_lettered_from)
        .bind(filter.dead_lettered_to)
        .bind(max_items as i64)
        .bind(next_attempt_on)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage<i64>, sqlx::Error> {
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        event: Event {
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
        },
        occurred_on: row.try_get("occurred_on")?,
        processed_on: row.try_get("processed_on")?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        next_attempt_on: row.try_get("next_attempt_on")?,
        dead_lettered_on: row.try_get("dead_lettered_on")?,
        error: row.try_get("error")?,
    })
}

/// Ensures the outbox table exists.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_message (
            id BIGSERIAL PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload BYTEA NOT NULL,
            occurred_on TIMESTAMPTZ NOT NULL,
            processed_on TIMESTAMPTZ,
            retry_count INT NOT NULL DEFAULT 0,
            next_attempt_on TIMESTAMPTZ NOT NULL,
            dead_lettered_on TIMESTAMPTZ,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS outbox_message_due_idx
         ON outbox_message (next_attempt_on)
         WHERE processed_on IS NULL AND dead_lettered_on IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {}", err)?,
        }
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Enqueuer;
    use crate::MessageState;

    async fn enqueue_committed(store: &PgStore, pool: &PgPool, event_type: &str) {
        let enqueuer = Enqueuer::new(store.clone());
        let mut tx = pool.begin().await.unwrap();
        enqueuer
            .enqueue([Event::new(event_type, b"{}".to_vec())], &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[sqlx::test]
    async fn enqueued_messages_are_claimable_oldest_first(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        enqueue_committed(&store, &pool, "mission.created").await;
        enqueue_committed(&store, &pool, "mission.updated").await;

        let claimed = store
            .claim_messages(Utc::now(), 10, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].event().event_type, "mission.created");
        assert_eq!(claimed[1].event().event_type, "mission.updated");
        assert_eq!(claimed[0].retry_count(), 0);
        assert_eq!(claimed[0].state(), MessageState::Active);
    }

    #[sqlx::test]
    async fn rollback_leaves_no_message(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        let enqueuer = Enqueuer::new(store.clone());

        let mut tx = pool.begin().await.unwrap();
        enqueuer
            .enqueue([Event::new("mission.created", b"{}".to_vec())], &mut tx)
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_message")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[sqlx::test]
    async fn claim_lease_excludes_the_message_from_other_claimers(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        enqueue_committed(&store, &pool, "mission.updated").await;

        let now = Utc::now();
        let first = store
            .claim_messages(now, 10, Duration::from_secs(30))
            .await
            .unwrap();
        let second = store
            .claim_messages(now, 10, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[sqlx::test]
    async fn processed_messages_never_show_up_again(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        enqueue_committed(&store, &pool, "mission.updated").await;

        let claimed = store
            .claim_messages(Utc::now(), 1, Duration::from_secs(30))
            .await
            .unwrap();
        store
            .mark_processed(claimed[0].id(), Utc::now())
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        let reclaimed = store
            .claim_messages(later, 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        let page = store.list_dead_letters(0, 10).await.unwrap();
        assert_eq!(page.total_count, 0);
    }

    #[sqlx::test]
    async fn failed_message_is_dead_lettered_and_resettable(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        enqueue_committed(&store, &pool, "metric.checked-in").await;

        let claimed = store
            .claim_messages(Utc::now(), 1, Duration::from_secs(30))
            .await
            .unwrap();
        let id = *claimed[0].id();

        store
            .mark_failed(
                &id,
                "downstream unavailable",
                FailureAction::DeadLetter {
                    dead_lettered_on: Utc::now(),
                },
            )
            .await
            .unwrap();

        let page = store.list_dead_letters(0, 10).await.unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].retry_count(), 1);
        assert_eq!(page.items[0].error(), Some("downstream unavailable"));

        let now = Utc::now();
        assert_eq!(
            store.reset_dead_letter(&id, now).await.unwrap(),
            ResetOutcome::Reset
        );
        assert_eq!(
            store.reset_dead_letter(&id, now).await.unwrap(),
            ResetOutcome::NotDeadLettered
        );
        assert_eq!(
            store.reset_dead_letter(&9999, now).await.unwrap(),
            ResetOutcome::NotFound
        );

        let reclaimed = store
            .claim_messages(now, 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count(), 0);
        assert!(reclaimed[0].error().is_none());
    }

    #[sqlx::test]
    async fn bulk_reset_applies_filter_and_bound(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        for event_type in ["mission.created", "mission.updated", "metric.checked-in"] {
            enqueue_committed(&store, &pool, event_type).await;
        }
        let claimed = store
            .claim_messages(Utc::now(), 10, Duration::from_secs(30))
            .await
            .unwrap();
        for msg in &claimed {
            store
                .mark_failed(
                    msg.id(),
                    "boom",
                    FailureAction::DeadLetter {
                        dead_lettered_on: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let filter = DeadLetterFilter {
            event_type_contains: Some("mission".to_owned()),
            ..Default::default()
        };
        let reset = store
            .reset_dead_letters(&filter, 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let remaining = store.list_dead_letters(0, 10).await.unwrap();
        assert_eq!(remaining.total_count, 2);
    }

    #[sqlx::test]
    async fn bulk_reset_filter_matches_literal_substrings_only(pool: PgPool) {
        let store = PgStore::try_new(pool.clone()).await.unwrap();
        for event_type in ["discount.100%.applied", "discount.1000.applied"] {
            enqueue_committed(&store, &pool, event_type).await;
        }
        let claimed = store
            .claim_messages(Utc::now(), 10, Duration::from_secs(30))
            .await
            .unwrap();
        for msg in &claimed {
            store
                .mark_failed(
                    msg.id(),
                    "boom",
                    FailureAction::DeadLetter {
                        dead_lettered_on: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        // "%" in the filter is a literal character, not a wildcard, so
        // "discount.1000.applied" must survive.
        let filter = DeadLetterFilter {
            event_type_contains: Some("100%".to_owned()),
            ..Default::default()
        };
        let reset = store
            .reset_dead_letters(&filter, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let remaining = store.list_dead_letters(0, 10).await.unwrap();
        assert_eq!(remaining.total_count, 1);
        assert_eq!(remaining.items[0].event().event_type, "discount.1000.applied");
    }
}
