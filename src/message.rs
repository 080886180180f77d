//! The persisted unit of reliable delivery.

use chrono::{DateTime, Utc};

use crate::Event;

/// A message stored in the outbox.
///
/// Each message consists of a backend-generated identifier, the original
/// [`Event`], and the delivery-state columns mutated by the dispatcher and
/// by dead-letter administration. Handlers never mutate a message; they only
/// report success or failure for it.
///
/// At any point in time a message is in exactly one of three states, derived
/// from the two terminal timestamps (see [`MessageState`]):
///
/// - *active*: eligible for future dispatch once `next_attempt_on` is due
/// - *processed*: the handler succeeded; terminal
/// - *dead-lettered*: retries are exhausted; terminal until an operator
///   resets it back into the active pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage<ID> {
    pub(crate) id: ID,
    pub(crate) event: Event,
    pub(crate) occurred_on: DateTime<Utc>,
    pub(crate) processed_on: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
    pub(crate) next_attempt_on: DateTime<Utc>,
    pub(crate) dead_lettered_on: Option<DateTime<Utc>>,
    pub(crate) error: Option<String>,
}

/// Delivery state of a message, derived from its terminal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Eligible for dispatch once `next_attempt_on` is due.
    Active,
    /// Handler reported success; the message left the active pipeline.
    Processed,
    /// Retries exhausted; pending operator action.
    DeadLettered,
}

impl<ID> OutboxMessage<ID> {
    /// Create a freshly enqueued message: active, zero retries, claimable
    /// immediately (`next_attempt_on == occurred_on`).
    pub(crate) fn enqueued(id: ID, event: Event, occurred_on: DateTime<Utc>) -> Self {
        Self {
            id,
            event,
            occurred_on,
            processed_on: None,
            retry_count: 0,
            next_attempt_on: occurred_on,
            dead_lettered_on: None,
            error: None,
        }
    }

    /// Store-assigned identifier.
    pub fn id(&self) -> &ID {
        &self.id
    }

    /// The event carried by this message.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Business time of the triggering state change. Immutable.
    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    /// Number of failed delivery attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Earliest instant at which the dispatcher may claim this message.
    ///
    /// Meaningless once the message is processed or dead-lettered.
    pub fn next_attempt_on(&self) -> DateTime<Utc> {
        self.next_attempt_on
    }

    /// When the handler reported success, if it has.
    pub fn processed_on(&self) -> Option<DateTime<Utc>> {
        self.processed_on
    }

    /// When the message was dead-lettered, if it has been.
    pub fn dead_lettered_on(&self) -> Option<DateTime<Utc>> {
        self.dead_lettered_on
    }

    /// Description of the most recent failed attempt.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Current delivery state.
    ///
    /// The two terminal timestamps are mutually exclusive; the store only
    /// ever sets one of them.
    pub fn state(&self) -> MessageState {
        match (self.processed_on, self.dead_lettered_on) {
            (Some(_), None) => MessageState::Processed,
            (None, Some(_)) => MessageState::DeadLettered,
            _ => MessageState::Active,
        }
    }
}
