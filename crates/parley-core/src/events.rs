//! Wire event envelope and typed payloads.
//!
//! Every frame on the socket and every queue body is an [`Event`]:
//! `{"type": "<tag>", "payload": <type-specific JSON>}`. The envelope keeps the
//! tag as a string so an unknown type survives decoding and can be rejected by
//! the router instead of killing the connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{ClientStatus, ServerStatus};
use crate::content::ContentEncoding;
use crate::conversation::{Feedback, Message, Phase, SummarySheet};
use crate::errors::{EventError, Result};
use crate::ids::{ConversationId, FeedbackId};

/// Every event tag the relay understands, inbound or outbound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Client → relay: a user message fragment.
    SendMessage,
    /// Relay → client: a message was recorded.
    NewMessage,
    /// Client → relay: feedback on a message or the conversation.
    UpdateFeedback,
    /// Relay → client: feedback was recorded.
    NewFeedback,
    /// Client → relay: composition status.
    SendStatus,
    /// Relay → client: worker status.
    NewStatus,
    /// Client → relay: attach to another conversation.
    ChangeRoom,
    /// Relay → client: a summary sheet is available.
    NewSummarySheet,
    /// Relay → client: a participant joined the room.
    NewUser,
    /// Relay → client: a participant left the room.
    LeaveUser,
    /// Relay → worker queue: a completed user turn.
    SendMessageToPrompt,
    /// Worker → relay queue: the worker's reply.
    NewMessageFromPrompt,
    /// Relay → worker queue: summarise an idle conversation.
    SendSummaryRequest,
    /// Worker → relay queue: the produced summary.
    NewSummaryRequest,
}

impl EventKind {
    const ALL: [Self; 14] = [
        Self::SendMessage,
        Self::NewMessage,
        Self::UpdateFeedback,
        Self::NewFeedback,
        Self::SendStatus,
        Self::NewStatus,
        Self::ChangeRoom,
        Self::NewSummarySheet,
        Self::NewUser,
        Self::LeaveUser,
        Self::SendMessageToPrompt,
        Self::NewMessageFromPrompt,
        Self::SendSummaryRequest,
        Self::NewSummaryRequest,
    ];

    /// Wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::NewMessage => "new_message",
            Self::UpdateFeedback => "update_feedback",
            Self::NewFeedback => "new_feedback",
            Self::SendStatus => "send_status",
            Self::NewStatus => "new_status",
            Self::ChangeRoom => "change_room",
            Self::NewSummarySheet => "new_summary_sheet",
            Self::NewUser => "new_user",
            Self::LeaveUser => "leave_user",
            Self::SendMessageToPrompt => "send_message_to_prompt",
            Self::NewMessageFromPrompt => "new_message_from_prompt",
            Self::SendSummaryRequest => "send_summary_request",
            Self::NewSummaryRequest => "new_summary_request",
        }
    }

    /// Look up a tag.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// The discriminated envelope exchanged over sockets and queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Type tag. Kept as a string; see [`Event::kind`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Build an event from a typed payload.
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(EventError::Encode)?;
        Ok(Self {
            event_type: kind.as_str().to_owned(),
            payload,
        })
    }

    /// Build an event with a `null` payload.
    pub fn bare(kind: EventKind) -> Self {
        Self {
            event_type: kind.as_str().to_owned(),
            payload: Value::Null,
        }
    }

    /// Known tag, or `None` for a type this relay does not understand.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_type)
    }

    /// Decode the payload into the schema named by the tag.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|source| EventError::Payload {
            event_type: self.event_type.clone(),
            source,
        })
    }

    /// Parse a JSON frame.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(EventError::Envelope)
    }

    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }

    /// `new_message` carrying a stored message.
    pub fn new_message(message: &Message) -> Result<Self> {
        Self::new(EventKind::NewMessage, message)
    }

    /// `new_feedback` carrying the recorded feedback.
    pub fn new_feedback(feedback: &Feedback) -> Result<Self> {
        Self::new(EventKind::NewFeedback, feedback)
    }

    /// `new_status` carrying a worker status.
    pub fn new_status(status: ServerStatus) -> Result<Self> {
        Self::new(EventKind::NewStatus, &NewStatusPayload { status })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `send_message`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    /// Conversation the client believes it is talking to.
    #[serde(rename = "chat_id", default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Message text.
    pub message: String,
    /// Author tag; the relay overwrites this for client-originated messages.
    #[serde(default)]
    pub from: String,
    /// Phase tag, computed by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Reasoning annotation; cleared for client-originated messages.
    #[serde(default)]
    pub reasoning: String,
    /// Declared body encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<ContentEncoding>,
}

/// Payload of `update_feedback`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFeedbackPayload {
    /// Feedback slot being filled.
    pub id: FeedbackId,
    /// Feedback text.
    #[serde(default)]
    pub message: String,
    /// Score.
    #[serde(default)]
    pub score: i32,
}

/// Payload of `send_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStatusPayload {
    /// Client composition status.
    pub status: ClientStatus,
}

/// Payload of `new_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStatusPayload {
    /// Worker status.
    pub status: ServerStatus,
}

/// Payload of `change_room`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRoomPayload {
    /// Conversation to attach to.
    pub room_id: ConversationId,
}

/// Payload of `new_user` / `leave_user`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Session identity that joined or left.
    pub identity: ConversationId,
    /// Room the presence change applies to.
    pub room: ConversationId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `send_message_to_prompt` and `send_summary_request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequestPayload {
    /// Text for the worker.
    pub message: String,
    /// Conversation the reply belongs to.
    pub from: ConversationId,
}

/// Payload of `new_message_from_prompt`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReplyPayload {
    /// Conversation the reply belongs to.
    pub from: ConversationId,
    /// Reply text.
    pub message: String,
    /// Updated selected-question counter, when the worker advanced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_selected_question: Option<u32>,
    /// Worker reasoning annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Declared body encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<ContentEncoding>,
}

/// Payload of `new_summary_request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReplyPayload {
    /// Conversation that was summarised.
    pub from: ConversationId,
    /// The summary.
    pub summary_sheet: SummarySheet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn through_wire<T>(kind: EventKind, payload: &T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let text = Event::new(kind, payload).unwrap().to_json().unwrap();
        let decoded = Event::from_json(&text).unwrap();
        assert_eq!(decoded.kind(), Some(kind));
        decoded.decode_payload().unwrap()
    }

    #[test]
    fn every_tag_parses_back() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
            let via_serde: EventKind = serde_json::from_value(json!(kind.as_str())).unwrap();
            assert_eq!(via_serde, kind);
        }
        assert_eq!(EventKind::parse("send_message_to_meeyok"), None);
    }

    #[test]
    fn unknown_type_survives_envelope_decode() {
        let event = Event::from_json(r#"{"type":"dance","payload":{"x":1}}"#).unwrap();
        assert_eq!(event.kind(), None);
        assert_eq!(event.event_type, "dance");
    }

    #[test]
    fn missing_payload_is_null() {
        let event = Event::from_json(r#"{"type":"new_summary_sheet"}"#).unwrap();
        assert_eq!(event.payload, Value::Null);
        assert_eq!(event, Event::bare(EventKind::NewSummarySheet));
    }

    #[test]
    fn malformed_frame_is_envelope_error() {
        assert_matches!(Event::from_json("{not json"), Err(EventError::Envelope(_)));
        assert_matches!(Event::from_json(r#"{"payload":{}}"#), Err(EventError::Envelope(_)));
    }

    #[test]
    fn payload_mismatch_is_payload_error() {
        let event = Event::from_json(r#"{"type":"send_status","payload":{"status":"dancing"}}"#).unwrap();
        let err = event.decode_payload::<SendStatusPayload>().unwrap_err();
        assert_matches!(err, EventError::Payload { ref event_type, .. } if event_type == "send_status");
    }

    #[test]
    fn send_message_round_trip() {
        let payload = SendMessagePayload {
            chat_id: Some("chat-1".into()),
            message: "hello".into(),
            from: "user".into(),
            phase: Some(Phase::Explore),
            reasoning: String::new(),
            encoding: Some(ContentEncoding::Base64),
        };
        assert_eq!(through_wire(EventKind::SendMessage, &payload), payload);
    }

    #[test]
    fn send_message_minimal_client_frame() {
        let event = Event::from_json(r#"{"type":"send_message","payload":{"message":"hello"}}"#).unwrap();
        let payload: SendMessagePayload = event.decode_payload().unwrap();
        assert_eq!(payload.message, "hello");
        assert!(payload.from.is_empty());
        assert_eq!(payload.phase, None);
    }

    #[test]
    fn new_message_round_trip() {
        let message = Message::new("user", "hello", Phase::Rapport, "");
        assert_eq!(through_wire(EventKind::NewMessage, &message), message);
    }

    #[test]
    fn feedback_round_trips() {
        let update = UpdateFeedbackPayload {
            id: FeedbackId::from("fb-1"),
            message: "great".into(),
            score: 5,
        };
        assert_eq!(through_wire(EventKind::UpdateFeedback, &update), update);
        let given = Feedback::given(FeedbackId::from("fb-1"), "great".into(), 5);
        assert_eq!(through_wire(EventKind::NewFeedback, &given), given);
    }

    #[test]
    fn status_round_trips() {
        let send = SendStatusPayload {
            status: ClientStatus::ClientSuccess,
        };
        assert_eq!(through_wire(EventKind::SendStatus, &send), send);
        let event = Event::new_status(ServerStatus::ServerLoading).unwrap();
        assert_eq!(event.payload, json!({"status": "server_loading"}));
    }

    #[test]
    fn room_and_presence_round_trips() {
        let change = ChangeRoomPayload {
            room_id: ConversationId::from("room-2"),
        };
        assert_eq!(through_wire(EventKind::ChangeRoom, &change), change);
        let presence = PresencePayload {
            identity: ConversationId::from("a"),
            room: ConversationId::from("room-2"),
        };
        assert_eq!(through_wire(EventKind::NewUser, &presence), presence);
        assert_eq!(through_wire(EventKind::LeaveUser, &presence), presence);
    }

    #[test]
    fn summary_sheet_round_trip() {
        let mut sheet = SummarySheet::default();
        sheet.basic.name = "Somchai".into();
        sheet.insight.issue = "sleep".into();
        assert_eq!(through_wire(EventKind::NewSummarySheet, &sheet), sheet);
    }

    #[test]
    fn queue_payload_shapes() {
        let request = WorkerRequestPayload {
            message: "hello".into(),
            from: ConversationId::from("chat-1"),
        };
        let event = Event::new(EventKind::SendMessageToPrompt, &request).unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "send_message_to_prompt", "payload": {"message": "hello", "from": "chat-1"}})
        );

        let reply: WorkerReplyPayload = serde_json::from_value(json!({
            "from": "chat-1",
            "message": "hi",
            "numberOfSelectedQuestion": 3
        }))
        .unwrap();
        assert_eq!(reply.number_of_selected_question, Some(3));
        assert_eq!(through_wire(EventKind::NewMessageFromPrompt, &reply), reply);

        let summary = SummaryReplyPayload {
            from: ConversationId::from("chat-1"),
            summary_sheet: SummarySheet::default(),
        };
        assert_eq!(through_wire(EventKind::NewSummaryRequest, &summary), summary);
    }
}
