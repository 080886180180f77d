#![doc = include_str!("../README.md")]

pub mod admin;
pub mod clock;
mod dispatcher;
mod event;
pub mod handler;
mod message;
pub mod retry;
pub mod store;

#[doc(inline)]
pub use event::Event;

#[doc(inline)]
pub use message::{MessageState, OutboxMessage};

#[doc(inline)]
pub use store::{Enqueuer, StoreError};

#[doc(inline)]
pub use dispatcher::{DefaultDispatcherHook, Dispatcher, DispatcherHook};

#[doc(inline)]
pub use handler::{Handler, HandlerRegistry};

#[doc(inline)]
pub use retry::{Decision, RetryPolicy};

#[doc(inline)]
pub use admin::{AdminError, AdminErrorKind, BulkReprocessRequest, DeadLetterAdmin};
