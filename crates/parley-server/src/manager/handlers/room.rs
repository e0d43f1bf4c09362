//! `change_room`: attach the session to another conversation.

use chrono::Utc;
use parley_core::events::{ChangeRoomPayload, EventKind};
use tracing::info;

use crate::errors::RouteError;
use crate::manager::ConnectionManager;
use crate::websocket::Session;

impl ConnectionManager {
    /// Re-point the session at `payload.room_id`, loaded fresh from the store.
    ///
    /// The old room is flushed first. Client state is left as it is. Other
    /// sessions in the old room see `leave_user`, those in the new one
    /// `new_user`.
    pub(crate) async fn change_room(&self, session: &Session, payload: ChangeRoomPayload) -> Result<(), RouteError> {
        let mut state = session.lock_state().await;
        if session.is_removing() {
            return Err(RouteError::SessionClosing);
        }
        let target = payload.room_id;
        let previous = state.conversation.id.clone();
        if target == previous {
            return Ok(());
        }

        let mut conversation = self.load_conversation(&target).await?;
        if conversation.expire_if_due(Utc::now(), &self.config.lifecycle) {
            self.store.update(&conversation).await?;
        }
        if conversation.is_closed() {
            return Err(RouteError::ConversationClosed(target));
        }

        self.flush(&mut state.conversation).await?;
        state.conversation = self.prime(conversation).await.conversation;
        session.set_room(target.clone());
        drop(state);

        info!(identity = %session.identity, from = %previous, to = %target, "room changed");
        self.announce(session, EventKind::LeaveUser, &previous);
        self.announce(session, EventKind::NewUser, &target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use parley_core::events::ChangeRoomPayload;
    use parley_core::ids::ConversationId;
    use parley_store::ConversationStore;

    use crate::errors::RouteError;
    use crate::test_support::{admit, drain_events, fixture, send_message};

    fn to(room: &str) -> ChangeRoomPayload {
        ChangeRoomPayload {
            room_id: ConversationId::from(room),
        }
    }

    #[tokio::test]
    async fn moves_conversation_and_keeps_client_state() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "user-1").await;
        send_message(&fx.manager, &session, "draft").await;

        fx.manager.change_room(&session, to("room-2")).await.unwrap();

        assert_eq!(session.room(), ConversationId::from("room-2"));
        let state = session.lock_state().await;
        assert_eq!(state.conversation.id, ConversationId::from("room-2"));
        assert!(state.conversation.messages.is_empty());
        assert_eq!(state.client.message, "draft");
        drop(state);

        // The old room was flushed on the way out.
        let old = fx.store.get(&ConversationId::from("user-1")).await.unwrap().unwrap();
        assert_eq!(old.messages.len(), 2);
    }

    #[tokio::test]
    async fn presence_reaches_both_rooms() {
        let fx = fixture();
        let (mover, _mover_rx) = admit(&fx.manager, "user-1").await;
        let (stayer, mut stayer_rx) = admit(&fx.manager, "user-2").await;
        let (host, mut host_rx) = admit(&fx.manager, "user-3").await;
        fx.manager.change_room(&stayer, to("user-1")).await.unwrap();
        fx.manager.change_room(&host, to("room-9")).await.unwrap();
        let _ = drain_events(&mut stayer_rx);
        let _ = drain_events(&mut host_rx);

        fx.manager.change_room(&mover, to("room-9")).await.unwrap();

        let left = drain_events(&mut stayer_rx);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event_type, "leave_user");
        assert_eq!(left[0].payload["identity"], "user-1");
        assert_eq!(left[0].payload["room"], "user-1");

        let joined = drain_events(&mut host_rx);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].event_type, "new_user");
        assert_eq!(joined[0].payload["room"], "room-9");
    }

    #[tokio::test]
    async fn closed_room_is_refused() {
        let fx = fixture();
        let (other, _rx) = admit(&fx.manager, "room-2").await;
        drop(other);
        let _ = fx.manager.terminate(&ConversationId::from("room-2")).await.unwrap();

        let (session, _rx) = admit(&fx.manager, "user-1").await;
        let err = fx.manager.change_room(&session, to("room-2")).await.unwrap_err();
        assert_matches!(err, RouteError::ConversationClosed(_));
        assert_eq!(session.room(), ConversationId::from("user-1"));
    }

    #[tokio::test]
    async fn same_room_is_a_no_op() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "user-1").await;
        send_message(&fx.manager, &session, "unflushed").await;
        fx.manager.change_room(&session, to("user-1")).await.unwrap();
        assert_eq!(session.lock_state().await.conversation.messages.len(), 2);
    }
}
