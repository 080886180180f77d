//! Dead-letter administration.
//!
//! Operator-facing operations over dead-lettered messages: a paginated
//! listing (most recently dead-lettered first, the most actionable view)
//! and single or bulk reprocessing that resets messages back into the
//! pending pipeline.
//!
//! All input validation happens here, before any store query executes; the
//! store traits stay free of request semantics. The optional HTTP surface
//! in [`http`] is a thin layer over this service.

#[cfg(feature = "http")]
pub mod http;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::clock::Clock;
use crate::store::{DeadLetterFilter, DeadLetterPage, DeadLetterStore, ResetOutcome};

/// Largest allowed page size for dead-letter listings.
pub const MAX_PAGE_SIZE: u64 = 200;

/// Largest allowed `max_items` for bulk reprocessing.
pub const MAX_BULK_ITEMS: u32 = 500;

/// Parameters for a bulk reprocess operation.
///
/// `event_type` is matched as a substring; the time window bounds
/// `dead_lettered_on` inclusively on both ends. `max_items` is required and
/// bounds how many messages a single call may reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReprocessRequest {
    /// Substring filter on the event type, if any.
    pub event_type: Option<String>,
    /// Inclusive lower bound on `dead_lettered_on`.
    pub dead_lettered_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `dead_lettered_on`.
    pub dead_lettered_to: Option<DateTime<Utc>>,
    /// Upper bound on messages reset by this call (1 to [`MAX_BULK_ITEMS`]).
    pub max_items: u32,
}

/// Administrative operations over dead-lettered messages.
pub struct DeadLetterAdmin<D> {
    store: D,
    clock: Arc<dyn Clock>,
}

impl<D> DeadLetterAdmin<D>
where
    D: DeadLetterStore,
    D::Error: Into<tower::BoxError>,
{
    /// Create an admin service over a store backend.
    pub fn new(store: D, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// List dead-lettered messages, most recently dead-lettered first.
    ///
    /// `page` is 1-based. Rejects `page == 0` and `page_size` outside
    /// 1..=[`MAX_PAGE_SIZE`] before querying.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<DeadLetterPage<D::ID>, AdminError> {
        if page == 0 || page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(AdminError::invalid_pagination(page, page_size));
        }
        // A page number large enough to overflow the offset cannot address
        // any real row either.
        let offset = page
            .checked_sub(1)
            .and_then(|p| p.checked_mul(page_size))
            .ok_or_else(|| AdminError::invalid_pagination(page, page_size))?;

        self.store
            .list_dead_letters(offset, page_size)
            .await
            .map_err(AdminError::store)
    }

    /// Reset one dead-lettered message back into the pending pipeline.
    ///
    /// Fails with `NotFound` if the message does not exist and with a
    /// validation error if it is not currently dead-lettered — reprocessing
    /// a live message is rejected, not silently ignored. On success the
    /// message has `retry_count = 0`, cleared error and terminal
    /// timestamps, and is claimable on the dispatcher's next cycle.
    #[instrument(skip(self))]
    pub async fn reprocess(&self, id: &D::ID) -> Result<(), AdminError>
    where
        D::ID: std::fmt::Debug,
    {
        let outcome = self
            .store
            .reset_dead_letter(id, self.clock.now())
            .await
            .map_err(AdminError::store)?;

        match outcome {
            ResetOutcome::Reset => Ok(()),
            ResetOutcome::NotFound => Err(AdminError::not_found()),
            ResetOutcome::NotDeadLettered => Err(AdminError::not_dead_lettered()),
        }
    }

    /// Reset up to `max_items` matching dead-lettered messages, oldest
    /// `dead_lettered_on` first. Returns the number actually reset.
    ///
    /// Rejects `max_items` outside 1..=[`MAX_BULK_ITEMS`] and an inverted
    /// time window before any query executes.
    #[instrument(skip(self, request))]
    pub async fn reprocess_bulk(&self, request: BulkReprocessRequest) -> Result<u64, AdminError> {
        if request.max_items == 0 || request.max_items > MAX_BULK_ITEMS {
            return Err(AdminError::invalid_max_items(request.max_items));
        }
        if let (Some(from), Some(to)) = (request.dead_lettered_from, request.dead_lettered_to) {
            if from > to {
                return Err(AdminError::invalid_window(from, to));
            }
        }

        let filter = DeadLetterFilter {
            event_type_contains: request.event_type,
            dead_lettered_from: request.dead_lettered_from,
            dead_lettered_to: request.dead_lettered_to,
        };

        self.store
            .reset_dead_letters(&filter, request.max_items, self.clock.now())
            .await
            .map_err(AdminError::store)
    }
}

/// Error returned by administrative operations.
#[derive(Debug)]
pub struct AdminError {
    context: SpanTrace,
    kind: AdminErrorKind,
}

/// Classification of administrative errors.
#[derive(Debug)]
pub enum AdminErrorKind {
    /// The reprocess target does not exist.
    NotFound,
    /// The reprocess target exists but is not dead-lettered.
    NotDeadLettered,
    /// Pagination outside the allowed range.
    InvalidPagination { page: u64, page_size: u64 },
    /// `max_items` outside 1..=[`MAX_BULK_ITEMS`].
    InvalidMaxItems(u32),
    /// `dead_lettered_from` is after `dead_lettered_to`.
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// The store itself failed.
    Store(tower::BoxError),
}

impl AdminError {
    fn new(kind: AdminErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn not_found() -> Self {
        Self::new(AdminErrorKind::NotFound)
    }

    fn not_dead_lettered() -> Self {
        Self::new(AdminErrorKind::NotDeadLettered)
    }

    fn invalid_pagination(page: u64, page_size: u64) -> Self {
        Self::new(AdminErrorKind::InvalidPagination { page, page_size })
    }

    fn invalid_max_items(max_items: u32) -> Self {
        Self::new(AdminErrorKind::InvalidMaxItems(max_items))
    }

    fn invalid_window(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self::new(AdminErrorKind::InvalidWindow { from, to })
    }

    fn store(err: impl Into<tower::BoxError>) -> Self {
        Self::new(AdminErrorKind::Store(err.into()))
    }

    /// The error classification, used by callers to map to a status code.
    pub fn kind(&self) -> &AdminErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AdminErrorKind::NotFound => writeln!(f, "Message not found"),
            AdminErrorKind::NotDeadLettered => {
                writeln!(f, "Message is not currently dead-lettered")
            }
            AdminErrorKind::InvalidPagination { page, page_size } => writeln!(
                f,
                "Invalid pagination: page {page} with page size {page_size} \
                 (page must be >= 1, page size within 1..={MAX_PAGE_SIZE})"
            ),
            AdminErrorKind::InvalidMaxItems(max_items) => writeln!(
                f,
                "Invalid maxItems {max_items}: must be within 1..={MAX_BULK_ITEMS}"
            ),
            AdminErrorKind::InvalidWindow { from, to } => {
                writeln!(f, "Invalid time window: {from} is after {to}")
            }
            AdminErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AdminErrorKind::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
