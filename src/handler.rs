//! Handler contract and per-event-type dispatch.
//!
//! A [`Handler`] performs the side effect for one logical event type (e.g.
//! resolving the recipients of a mission update and writing per-recipient
//! notification rows). The [`HandlerRegistry`] maps event-type strings to
//! handlers so the dispatcher stays agnostic of what any given event does.
//!
//! Handlers must be idempotent: delivery is at-least-once and a handler may
//! see the same message more than once after a crash or an expired claim.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::Event;

/// Side-effect function for one event type.
///
/// A handler receives the event and returns success or an error describing
/// the failure. It must not assume anything about delivery order and must
/// tolerate duplicate invocations. Errors are recorded on the message and
/// fed to the retry policy; they never abort the dispatcher.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Perform the side effect for the given event.
    async fn handle(&self, event: &Event) -> Result<(), tower::BoxError>;
}

/// Adapter turning an async closure into a [`Handler`].
///
/// The closure receives its own copy of the event, so the returned future
/// owns everything it needs.
///
/// ## Example
///
/// ```rust
/// use relaybox::handler::{handler_fn, HandlerRegistry};
///
/// let registry = HandlerRegistry::new().with_handler(
///     "mission.updated",
///     handler_fn(|event| async move {
///         // fan out notifications for `event.payload`
///         let _ = event.payload;
///         Ok(())
///     }),
/// );
/// assert!(registry.resolve("mission.updated").is_some());
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
{
    HandlerFn(f)
}

/// [`Handler`] backed by a closure. Built with [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), tower::BoxError> {
        (self.0)(event.clone()).await
    }
}

/// Maps event-type strings to the handlers that consume them.
///
/// The registry is immutable once built and cheap to clone; registrations
/// happen at wiring time, before the dispatcher starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type, replacing any previous one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler(
        mut self,
        event_type: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Self {
        self.register(event_type, handler);
        self
    }

    /// Look up the handler for an event type.
    ///
    /// `None` means no consumer exists for the type; the dispatcher treats
    /// that as a permanent failure since retrying cannot succeed.
    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(event_type).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
