//! `send_message`: echo, record, and accumulate into the pending draft.

use parley_core::client::ClientStatus;
use parley_core::content::decode_body;
use parley_core::conversation::{Message, ROLE_USER};
use parley_core::events::{Event, EventKind, SendMessagePayload};

use crate::errors::RouteError;
use crate::manager::ConnectionManager;
use crate::websocket::Session;

impl ConnectionManager {
    /// Echo the re-tagged message, record it, and append it to the draft.
    ///
    /// The echo carries the computed phase with the author set to `user` and
    /// the reasoning cleared. The stored message goes out as `new_message` to
    /// the session and its room. The draft is only published when the client
    /// reports `client_success`.
    pub(crate) async fn send_message(&self, session: &Session, mut payload: SendMessagePayload) -> Result<(), RouteError> {
        let mut state = session.lock_state().await;
        self.ensure_open(session, &mut state).await?;

        let text = decode_body(&payload.message, payload.encoding, self.config.legacy_base64_sniffing)?;
        let phase = state.conversation.prompt_data.phase();
        payload.chat_id = Some(state.conversation.id.to_string());
        payload.from = ROLE_USER.into();
        payload.phase = Some(phase);
        payload.reasoning.clear();
        let _ = session.send(Event::new(EventKind::SendMessage, &payload)?);

        self.record_message(session, &mut state, Message::new(ROLE_USER, text.as_str(), phase, ""))
            .await?;
        state.client.append_draft(&text);
        state.client.client_status = Some(ClientStatus::ClientLoading);
        self.mirror_client(&state).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use parley_core::conversation::Phase;
    use parley_core::events::Event;
    use parley_core::ids::ConversationId;
    use parley_store::{CacheMirror, ConversationStore};
    use serde_json::json;

    use crate::errors::RouteError;
    use crate::test_support::{admit, drain_events, fixture, send_message};

    #[tokio::test]
    async fn echo_is_retagged() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        let _ = drain_events(&mut rx);

        let raw = json!({"type": "send_message", "payload": {"message": "hello", "from": "mallory", "reasoning": "x"}});
        fx.manager
            .route(&session, serde_json::from_value(raw).unwrap())
            .await
            .unwrap();

        let events = drain_events(&mut rx);
        assert_eq!(events[0].event_type, "send_message");
        assert_eq!(events[0].payload["from"], "user");
        assert_eq!(events[0].payload["reasoning"], "");
        assert_eq!(events[0].payload["phase"], "rapport");
        assert_eq!(events[0].payload["chat_id"], "chat-1");
        assert_eq!(events[1].event_type, "new_message");
        assert_eq!(events[1].payload["message"], "hello");
        assert_eq!(events[1].payload["role"], "user");
    }

    #[tokio::test]
    async fn fragments_accumulate_into_loading_draft() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        send_message(&fx.manager, &session, "hello").await;
        send_message(&fx.manager, &session, "there").await;

        let state = session.lock_state().await;
        assert_eq!(state.client.message, "hello there");
        assert!(state.client.is_loading());
        drop(state);

        let cached = fx.cache.get(&ConversationId::from("chat-1")).await.unwrap().unwrap();
        assert_eq!(cached.client.message, "hello there");
        // welcome line + two user messages
        assert_eq!(cached.conversation.messages.len(), 3);
    }

    #[tokio::test]
    async fn phase_follows_selected_question_counter() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        session.lock_state().await.conversation.prompt_data.number_of_selected_question = 12;
        let _ = drain_events(&mut rx);

        send_message(&fx.manager, &session, "done?").await;
        let events = drain_events(&mut rx);
        assert_eq!(events[0].payload["phase"], "end");
        let stored = session.lock_state().await.conversation.messages.last().cloned().unwrap();
        assert_eq!(stored.phase, Phase::End);
    }

    #[tokio::test]
    async fn declared_base64_is_decoded() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        let raw = json!({"type": "send_message", "payload": {"message": "aGVsbG8=", "encoding": "base64"}});
        fx.manager
            .route(&session, serde_json::from_value(raw).unwrap())
            .await
            .unwrap();
        assert_eq!(session.lock_state().await.client.message, "hello");
    }

    #[tokio::test]
    async fn undeclared_base64_is_left_alone() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        send_message(&fx.manager, &session, "abcd").await;
        assert_eq!(session.lock_state().await.client.message, "abcd");
    }

    #[tokio::test]
    async fn invalid_base64_is_rejected_without_echo() {
        let fx = fixture();
        let (session, mut rx) = admit(&fx.manager, "chat-1").await;
        let _ = drain_events(&mut rx);
        let raw = json!({"type": "send_message", "payload": {"message": "%%%", "encoding": "base64"}});
        let err = fx
            .manager
            .route(&session, serde_json::from_value::<Event>(raw).unwrap())
            .await
            .unwrap_err();
        assert_matches!(err, RouteError::Payload(_));
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn sequential_messages_keep_order() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        for i in 0..10 {
            send_message(&fx.manager, &session, &format!("m{i}")).await;
        }
        fx.manager.remove(&session).await;

        let stored = fx.store.get(&ConversationId::from("chat-1")).await.unwrap().unwrap();
        let texts: Vec<_> = stored.messages.iter().skip(1).map(|m| m.message.clone()).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn concurrent_sessions_in_one_room_lose_nothing() {
        let fx = fixture();
        let room = ConversationId::from("room-1");
        let mut sessions = Vec::new();
        for i in 0..8 {
            let (session, _rx) = admit(&fx.manager, &format!("user-{i}")).await;
            fx.manager
                .change_room(&session, parley_core::events::ChangeRoomPayload { room_id: room.clone() })
                .await
                .unwrap();
            sessions.push(session);
        }

        let mut handles = Vec::new();
        for (i, session) in sessions.iter().enumerate() {
            let manager = Arc::clone(&fx.manager);
            let session = Arc::clone(session);
            handles.push(tokio::spawn(async move {
                send_message(&manager, &session, &format!("from {i}")).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        fx.manager.drain().await;

        let stored = fx.store.get(&room).await.unwrap().unwrap();
        let mut texts: Vec<_> = stored.messages.iter().map(|m| m.message.clone()).collect();
        texts.sort();
        let mut expected: Vec<_> = (0..8).map(|i| format!("from {i}")).collect();
        expected.sort();
        assert_eq!(texts, expected);
    }
}
