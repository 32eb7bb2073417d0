//! Event wire encoding.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

use crate::error::EventBusError;
use crate::event::Event;

/// Converts events to and from message payloads.
pub trait EventSerializer<E: Event>: Send + Sync + 'static {
    fn to_bytes(&self, event: &E) -> Result<Vec<u8>, EventBusError>;

    /// Fails with [`EventBusError::MalformedMessage`] on unparseable input.
    fn from_bytes(&self, payload: &[u8]) -> Result<E, EventBusError>;
}

/// JSON encoding through serde.
pub struct JsonEventSerializer<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventSerializer<E> for JsonEventSerializer<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    fn to_bytes(&self, event: &E) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(event)
            .map_err(|e| EventBusError::InvalidArgument(format!("event is not serializable: {e}")))
    }

    fn from_bytes(&self, payload: &[u8]) -> Result<E, EventBusError> {
        serde_json::from_slice(payload)
            .map_err(|e| EventBusError::MalformedMessage(format!("invalid event payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        event_id: EventId,
        from: String,
        to: String,
    }

    impl Event for Renamed {
        fn event_id(&self) -> EventId {
            self.event_id
        }
    }

    #[test]
    fn test_json_round_trip() {
        let serializer = JsonEventSerializer::<Renamed>::new();
        let event = Renamed {
            event_id: EventId::random(),
            from: "INBOX.old".into(),
            to: "INBOX.new".into(),
        };
        let bytes = serializer.to_bytes(&event).unwrap();
        assert_eq!(serializer.from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn test_malformed_payload() {
        let serializer = JsonEventSerializer::<Renamed>::new();
        for payload in [&b"not json"[..], b"{}", b""] {
            assert!(matches!(
                serializer.from_bytes(payload),
                Err(EventBusError::MalformedMessage(_))
            ));
        }
    }
}
