//! `update_feedback`: fill a conversation-level or per-message feedback slot.

use parley_core::conversation::Feedback;
use parley_core::events::{Event, UpdateFeedbackPayload};

use crate::errors::RouteError;
use crate::manager::ConnectionManager;
use crate::websocket::Session;

impl ConnectionManager {
    /// Record feedback and echo it as `new_feedback`.
    ///
    /// The slot is looked up on the conversation first, then among the
    /// unflushed messages, then in the durable store.
    pub(crate) async fn update_feedback(&self, session: &Session, payload: UpdateFeedbackPayload) -> Result<(), RouteError> {
        let mut state = session.lock_state().await;
        self.ensure_open(session, &mut state).await?;

        let feedback = Feedback::given(payload.id, payload.message, payload.score);
        let conversation = &mut state.conversation;
        if conversation.feedback.id == feedback.id {
            conversation.feedback = feedback.clone();
            self.store
                .update_conversation_feedback(&conversation.id, &feedback)
                .await?;
        } else if let Some(message) = conversation.message_by_feedback_mut(&feedback.id) {
            message.feedback = feedback.clone();
        } else if !self.store.update_message_feedback(&feedback).await? {
            return Err(RouteError::UnknownFeedback(feedback.id));
        }

        let _ = session.send(Event::new_feedback(&feedback)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use parley_core::events::UpdateFeedbackPayload;
    use parley_core::ids::{ConversationId, FeedbackId};
    use parley_store::ConversationStore;

    use crate::errors::RouteError;
    use crate::test_support::{admit, drain_events, fixture, send_message};

    fn payload(id: &FeedbackId, score: i32) -> UpdateFeedbackPayload {
        UpdateFeedbackPayload {
            id: id.clone(),
            message: "helpful".into(),
            score,
        }
    }

    #[tokio::test]
    async fn conversation_slot_is_persisted_at_once() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        let slot = session.lock_state().await.conversation.feedback.id.clone();
        let _ = drain_events(&mut rx);

        fx.manager.update_feedback(&session, payload(&slot, 5)).await.unwrap();

        let stored = fx.store.get(&ConversationId::from("chat-1")).await.unwrap().unwrap();
        assert!(stored.feedback.status);
        assert_eq!(stored.feedback.score, 5);
        let echo = drain_events(&mut rx);
        assert_eq!(echo[0].event_type, "new_feedback");
        assert_eq!(echo[0].payload["score"], 5);
    }

    #[tokio::test]
    async fn unflushed_message_slot_is_updated_in_memory() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        send_message(&fx.manager, &session, "rate me").await;
        let slot = session.lock_state().await.conversation.messages.last().unwrap().feedback.id.clone();

        fx.manager.update_feedback(&session, payload(&slot, 4)).await.unwrap();
        let state = session.lock_state().await;
        let message = state.conversation.messages.last().unwrap();
        assert!(message.feedback.status);
        assert_eq!(message.feedback.score, 4);
    }

    #[tokio::test]
    async fn flushed_message_slot_falls_back_to_store() {
        let fx = fixture();
        let (first, _rx) = admit(&fx.manager, "chat-1").await;
        send_message(&fx.manager, &first, "rate me later").await;
        let slot = first.lock_state().await.conversation.messages.last().unwrap().feedback.id.clone();
        fx.manager.remove(&first).await;

        let (second, _rx) = admit(&fx.manager, "chat-1").await;
        fx.manager.update_feedback(&second, payload(&slot, 2)).await.unwrap();

        let stored = fx.store.get(&ConversationId::from("chat-1")).await.unwrap().unwrap();
        let message = stored.messages.iter().find(|m| m.feedback.id == slot).unwrap();
        assert_eq!(message.feedback.score, 2);
    }

    #[tokio::test]
    async fn unknown_slot_is_reported() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        let _ = drain_events(&mut rx);
        let err = fx
            .manager
            .update_feedback(&session, payload(&FeedbackId::from("nope"), 1))
            .await
            .unwrap_err();
        assert_matches!(err, RouteError::UnknownFeedback(id) if id.as_str() == "nope");
        assert!(drain_events(&mut rx).is_empty());
    }
}
