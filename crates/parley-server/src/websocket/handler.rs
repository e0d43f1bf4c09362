//! Inbound frame decoding.

use parley_core::EventError;
use parley_core::events::Event;

/// Decode a text or binary frame as an [`Event`] envelope.
///
/// Only the envelope is checked here; payloads are decoded by the router so
/// an unknown type or a bad payload does not end the session.
pub fn decode_frame(bytes: &[u8]) -> Result<Event, EventError> {
    serde_json::from_slice(bytes).map_err(EventError::Envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decodes_envelope() {
        let event = decode_frame(br#"{"type":"send_message","payload":{"message":"hi"}}"#).unwrap();
        assert_eq!(event.event_type, "send_message");
        assert_eq!(event.payload["message"], "hi");
    }

    #[test]
    fn unknown_type_still_decodes() {
        let event = decode_frame(br#"{"type":"dance"}"#).unwrap();
        assert!(event.kind().is_none());
        assert!(event.payload.is_null());
    }

    #[test]
    fn garbage_is_an_envelope_error() {
        assert_matches!(decode_frame(b"not json"), Err(EventError::Envelope(_)));
        assert_matches!(decode_frame(br#"{"payload":{}}"#), Err(EventError::Envelope(_)));
        assert_matches!(decode_frame(&[0xff, 0xfe]), Err(EventError::Envelope(_)));
    }
}
