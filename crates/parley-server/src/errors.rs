//! Error types for the connection manager, router, and queue bridge.

use std::time::Duration;

use parley_core::EventError;
use parley_core::conversation::ConversationStatus;
use parley_core::ids::{ConversationId, FeedbackId};
use parley_store::StoreError;
use thiserror::Error;

/// Failures of manager-level operations (admission, delivery, termination).
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A previous session for this identity did not leave in time.
    #[error("could not evict prior session for '{identity}' within {waited:?}")]
    EvictionTimeout {
        /// Identity being admitted.
        identity: ConversationId,
        /// How long admission waited.
        waited: Duration,
    },

    /// The conversation no longer accepts sessions.
    #[error("conversation '{identity}' is {}", status.as_str())]
    ConversationClosed {
        /// Conversation identity.
        identity: ConversationId,
        /// Its lifecycle status.
        status: ConversationStatus,
    },

    /// Another session for this identity was admitted first.
    #[error("identity '{0}' already has a live session")]
    AlreadyConnected(ConversationId),

    /// No such conversation.
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    /// Delivery kept racing with session admission or removal.
    #[error("delivery to '{0}' kept contending with session changes")]
    DeliveryContended(ConversationId),

    /// The final flush failed after all retries.
    #[error("could not persist conversation '{0}'")]
    FlushFailed(ConversationId),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event encode/decode failure.
    #[error(transparent)]
    Event(#[from] EventError),
}

/// Failures while routing one inbound event. Never fatal to the connection.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No handler for this event type.
    #[error("unsupported event type '{0}'")]
    Unsupported(String),

    /// The payload did not match the schema of its type, or could not be encoded.
    #[error(transparent)]
    Payload(#[from] EventError),

    /// A status transition that cannot be applied now.
    #[error("invalid status '{status}': {reason}")]
    InvalidStatus {
        /// Status the client sent.
        status: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },

    /// Feedback addressed a slot that does not exist.
    #[error("unknown feedback slot: {0}")]
    UnknownFeedback(FeedbackId),

    /// The conversation has completed or was terminated.
    #[error("conversation '{0}' is closed")]
    ConversationClosed(ConversationId),

    /// The session is being removed.
    #[error("session is closing")]
    SessionClosing,

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publishing to the worker queue failed.
    #[error("publish failed: {0}")]
    Publish(#[source] StoreError),
}

impl RouteError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported",
            Self::Payload(_) => "payload",
            Self::InvalidStatus { .. } => "invalid_status",
            Self::UnknownFeedback(_) => "unknown_feedback",
            Self::ConversationClosed(_) => "conversation_closed",
            Self::SessionClosing => "session_closing",
            Self::Store(_) => "store",
            Self::Publish(_) => "publish",
        }
    }
}

/// Failures while processing one queue message. The message stays undeleted.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Body is not an event envelope, or its payload does not match.
    #[error(transparent)]
    Decode(#[from] EventError),

    /// The envelope carries a type the bridge does not consume.
    #[error("unexpected event type '{0}' on result queue")]
    Unexpected(String),

    /// The manager could not apply the result.
    #[error(transparent)]
    Delivery(#[from] ManagerError),

    /// Queue acknowledgement failed.
    #[error(transparent)]
    Queue(#[from] StoreError),
}

impl BridgeError {
    /// Whether redelivering the same body can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Unexpected(_) | Self::Delivery(ManagerError::NotFound(_) | ManagerError::Event(_))
        )
    }
}
