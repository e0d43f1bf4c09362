//! Closed dispatch over the inbound event set.
//!
//! The envelope keeps its tag as a string so an unknown type reaches this
//! point; [`InboundEvent::decode`] turns it into a typed variant or a
//! [`RouteError`]. Routing errors are reported to the reader loop and never
//! close the connection.

use metrics::counter;
use parley_core::events::{
    ChangeRoomPayload, Event, EventKind, SendMessagePayload, SendStatusPayload, UpdateFeedbackPayload,
};
use tracing::{debug, instrument};

use super::ConnectionManager;
use crate::errors::RouteError;
use crate::metrics::{RELAY_EVENTS_ROUTED_TOTAL, RELAY_ROUTE_ERRORS_TOTAL};
use crate::websocket::Session;

/// An event a client may send, with its decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// A message fragment.
    SendMessage(SendMessagePayload),
    /// Feedback on a message or the conversation.
    UpdateFeedback(UpdateFeedbackPayload),
    /// Composition status.
    SendStatus(SendStatusPayload),
    /// Attach to another conversation.
    ChangeRoom(ChangeRoomPayload),
}

impl InboundEvent {
    /// Decode an envelope into an inbound variant.
    pub fn decode(event: &Event) -> Result<Self, RouteError> {
        match event.kind() {
            Some(EventKind::SendMessage) => Ok(Self::SendMessage(event.decode_payload()?)),
            Some(EventKind::UpdateFeedback) => Ok(Self::UpdateFeedback(event.decode_payload()?)),
            Some(EventKind::SendStatus) => Ok(Self::SendStatus(event.decode_payload()?)),
            Some(EventKind::ChangeRoom) => Ok(Self::ChangeRoom(event.decode_payload()?)),
            _ => Err(RouteError::Unsupported(event.event_type.clone())),
        }
    }

    /// Tag of the variant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SendMessage(_) => EventKind::SendMessage,
            Self::UpdateFeedback(_) => EventKind::UpdateFeedback,
            Self::SendStatus(_) => EventKind::SendStatus,
            Self::ChangeRoom(_) => EventKind::ChangeRoom,
        }
    }
}

impl ConnectionManager {
    /// Decode `event` and run its handler against `session`.
    #[instrument(skip_all, fields(identity = %session.identity, event_type = %event.event_type))]
    pub async fn route(&self, session: &Session, event: Event) -> Result<(), RouteError> {
        let inbound = InboundEvent::decode(&event).inspect_err(|error| {
            counter!(RELAY_ROUTE_ERRORS_TOTAL, "error" => error.kind()).increment(1);
        })?;
        let kind = inbound.kind();
        let result = match inbound {
            InboundEvent::SendMessage(payload) => self.send_message(session, payload).await,
            InboundEvent::UpdateFeedback(payload) => self.update_feedback(session, payload).await,
            InboundEvent::SendStatus(payload) => self.send_status(session, payload).await,
            InboundEvent::ChangeRoom(payload) => self.change_room(session, payload).await,
        };
        match &result {
            Ok(()) => {
                counter!(RELAY_EVENTS_ROUTED_TOTAL, "event_type" => kind.as_str()).increment(1);
                debug!("event handled");
            }
            Err(error) => counter!(RELAY_ROUTE_ERRORS_TOTAL, "error" => error.kind()).increment(1),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{admit, drain_events, fixture};
    use assert_matches::assert_matches;
    use parley_core::client::ClientStatus;
    use parley_core::ids::ConversationId;
    use serde_json::json;

    fn event(text: &str) -> Event {
        Event::from_json(text).unwrap()
    }

    #[test]
    fn decodes_each_inbound_variant() {
        let send = event(r#"{"type":"send_message","payload":{"message":"hi"}}"#);
        assert_matches!(InboundEvent::decode(&send), Ok(InboundEvent::SendMessage(p)) if p.message == "hi");

        let status = event(r#"{"type":"send_status","payload":{"status":"client_success"}}"#);
        assert_matches!(
            InboundEvent::decode(&status),
            Ok(InboundEvent::SendStatus(SendStatusPayload { status: ClientStatus::ClientSuccess }))
        );

        let feedback = event(r#"{"type":"update_feedback","payload":{"id":"fb-1","message":"ok","score":3}}"#);
        assert_eq!(InboundEvent::decode(&feedback).unwrap().kind(), EventKind::UpdateFeedback);

        let room = event(r#"{"type":"change_room","payload":{"room_id":"room-2"}}"#);
        assert_matches!(
            InboundEvent::decode(&room),
            Ok(InboundEvent::ChangeRoom(p)) if p.room_id == ConversationId::from("room-2")
        );
    }

    #[test]
    fn outbound_and_unknown_types_are_unsupported() {
        let unknown = event(r#"{"type":"dance","payload":{}}"#);
        assert_matches!(InboundEvent::decode(&unknown), Err(RouteError::Unsupported(t)) if t == "dance");

        // Known tag, but not one a client may send.
        let outbound = Event::new(EventKind::NewUser, &json!({})).unwrap();
        assert_matches!(InboundEvent::decode(&outbound), Err(RouteError::Unsupported(_)));
    }

    #[test]
    fn payload_mismatch_is_payload_error() {
        let bad = event(r#"{"type":"send_status","payload":{"status":"dancing"}}"#);
        assert_matches!(InboundEvent::decode(&bad), Err(RouteError::Payload(_)));
    }

    #[tokio::test]
    async fn unknown_type_leaves_session_usable() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        let _ = drain_events(&mut rx);

        let err = fx.manager.route(&session, event(r#"{"type":"dance"}"#)).await.unwrap_err();
        assert_matches!(err, RouteError::Unsupported(_));

        fx.manager
            .route(&session, event(r#"{"type":"send_message","payload":{"message":"still here"}}"#))
            .await
            .unwrap();
        let types: Vec<_> = drain_events(&mut rx).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, ["send_message", "new_message"]);
    }

    #[tokio::test]
    async fn closed_conversation_refuses_events() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        session.lock_state().await.conversation.terminate();

        let err = fx
            .manager
            .route(&session, event(r#"{"type":"send_message","payload":{"message":"late"}}"#))
            .await
            .unwrap_err();
        assert_matches!(err, RouteError::ConversationClosed(id) if id == ConversationId::from("chat-1"));
    }
}
