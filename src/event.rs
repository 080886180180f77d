/// Integration event handed to the outbox and to handlers.
///
/// `Event` bundles a type discriminator together with an opaque payload.
/// The store never interprets the payload; only the handler registered for
/// `event_type` does.
///
/// ## Design
///
/// - `event_type` is a logical event name (e.g. a fully-qualified name such
///   as `"missions.mission.updated"`), used for handler dispatch and for
///   filtered bulk reprocessing
/// - `payload` is the serialized event body, produced and consumed by the
///   domain layer
///
/// Keeping the payload opaque means the outbox core has no dependency on any
/// particular event schema or serialization format.
///
/// ## Conversion
///
/// `Event` implements `From<(T, P)>` for ergonomic construction when the
/// type and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use relaybox::Event;
///
/// let event = Event::new("mission.updated", br#"{"missionId":"M1"}"#.to_vec());
///
/// // or, equivalently
/// let event: Event = ("mission.updated", br#"{"missionId":"M1"}"#.to_vec()).into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Logical event name, the handler-dispatch discriminator.
    pub event_type: String,
    /// Serialized event body, opaque to the outbox.
    pub payload: Vec<u8>,
}

impl Event {
    /// Create a new event from a type name and serialized payload.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

impl<T, P> From<(T, P)> for Event
where
    T: Into<String>,
    P: Into<Vec<u8>>,
{
    fn from(value: (T, P)) -> Self {
        Event::new(value.0, value.1)
    }
}
