//! Error types for wire decoding.

/// Failure to decode or encode a wire [`Event`](crate::events::Event) or its payload.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The frame is not a valid event envelope.
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The payload does not match the schema named by the event type.
    #[error("invalid payload for '{event_type}': {source}")]
    Payload {
        /// Event type whose payload failed to decode.
        event_type: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A typed payload could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// A message body flagged as encoded could not be decoded.
    #[error("invalid {encoding} message body: {reason}")]
    Content {
        /// Declared encoding.
        encoding: &'static str,
        /// Why decoding failed.
        reason: String,
    },
}

/// Convenience alias for wire decoding results.
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_error_names_event_type() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = EventError::Payload {
            event_type: "send_status".into(),
            source,
        };
        assert!(err.to_string().starts_with("invalid payload for 'send_status'"));
    }

    #[test]
    fn content_error_display() {
        let err = EventError::Content {
            encoding: "base64",
            reason: "bad padding".into(),
        };
        assert_eq!(err.to_string(), "invalid base64 message body: bad padding");
    }
}
