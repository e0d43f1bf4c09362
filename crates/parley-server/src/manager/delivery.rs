//! Delivery of worker results: to a live session, or to the durable store
//! through a transient stand-in when nobody is connected.

use std::sync::Arc;

use parley_core::EventError;
use parley_core::client::ServerStatus;
use parley_core::content::decode_body;
use parley_core::conversation::Message;
use parley_core::events::{Event, EventKind, SummaryReplyPayload, WorkerReplyPayload};
use parley_core::ids::ConversationId;
use tracing::{debug, info, instrument};

use super::ConnectionManager;
use crate::errors::ManagerError;
use crate::websocket::{Session, SessionState};

/// Tries before a delivery that keeps racing admission or removal gives up.
const DELIVERY_ATTEMPTS: usize = 5;

/// Which status a delivered reply carries to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The worker replied normally.
    Success,
    /// The reply came off the dead-letter queue.
    Error,
}

impl DeliveryOutcome {
    /// Server status reported with the reply.
    pub fn status(self) -> ServerStatus {
        match self {
            Self::Success => ServerStatus::ServerSuccess,
            Self::Error => ServerStatus::ServerError,
        }
    }
}

impl ConnectionManager {
    /// A session currently attached to `room`, preferring the one admitted
    /// under that identity.
    fn session_for_room(&self, room: &ConversationId) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        if let Some(session) = sessions.get(room).filter(|s| s.room() == *room) {
            return Some(Arc::clone(session));
        }
        sessions.values().find(|s| s.room() == *room).cloned()
    }

    /// Apply a worker reply to its conversation.
    ///
    /// With a live session attached to the conversation the reply is recorded
    /// there and the client sees `new_message` and `new_status`. Otherwise it
    /// is delivered offline, see
    /// [`deliver_to_offline_identity`](Self::deliver_to_offline_identity).
    /// A dead-lettered reply records nothing; only the error status is set.
    #[instrument(skip_all, fields(identity = %reply.from, outcome = ?outcome))]
    pub async fn deliver_worker_reply(&self, reply: WorkerReplyPayload, outcome: DeliveryOutcome) -> Result<(), ManagerError> {
        let text = decode_body(&reply.message, reply.encoding, self.config.legacy_base64_sniffing)?;
        let room = reply.from.clone();

        for attempt in 0..DELIVERY_ATTEMPTS {
            if let Some(session) = self.session_for_room(&room) {
                let mut state = session.lock_state().await;
                if session.is_removing() {
                    drop(state);
                    session.closed().await;
                    debug!(attempt, "target session left, retrying");
                    continue;
                }
                if state.conversation.id != room {
                    continue;
                }
                self.apply_worker_reply(&session, &mut state, &reply, &text, outcome).await?;
                debug!(connection_id = %session.connection_id, "reply delivered live");
                return Ok(());
            }
            if self.deliver_to_offline_identity(&reply, &text, outcome).await? {
                return Ok(());
            }
            debug!(attempt, "identity admitted during offline delivery, retrying");
        }
        Err(ManagerError::DeliveryContended(room))
    }

    /// Apply a reply with no live session attached.
    ///
    /// A transient, transport-less session is built from durable and cached
    /// state, takes the identity slot for the duration, records the reply,
    /// flushes, and is discarded. Nothing is written to any transport.
    ///
    /// Returns `false` if a live session claimed the identity first; the
    /// caller should retry through the live path. A conversation that was
    /// never stored is [`ManagerError::NotFound`].
    pub async fn deliver_to_offline_identity(
        &self,
        reply: &WorkerReplyPayload,
        text: &str,
        outcome: DeliveryOutcome,
    ) -> Result<bool, ManagerError> {
        let room = &reply.from;
        let conversation = self
            .store
            .get(room)
            .await?
            .ok_or_else(|| ManagerError::NotFound(room.clone()))?;
        let state = self.prime(conversation).await;
        let session = Arc::new(Session::transient(room.clone(), state));

        match self.try_insert(&session) {
            Ok(()) => {
                let applied = self.apply_and_flush(&session, reply, text, outcome).await;
                self.remove(&session).await;
                applied?;
            }
            Err(occupant) if occupant.room() != *room => {
                // The identity's owner is attached elsewhere; nobody to race.
                self.apply_and_flush(&session, reply, text, outcome).await?;
            }
            Err(_) => return Ok(false),
        }
        info!(identity = %room, "reply delivered offline");
        Ok(true)
    }

    async fn apply_and_flush(
        &self,
        session: &Session,
        reply: &WorkerReplyPayload,
        text: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), ManagerError> {
        let mut state = session.lock_state().await;
        self.apply_worker_reply(session, &mut state, reply, text, outcome).await?;
        self.flush(&mut state.conversation)
            .await
            .map_err(|_| ManagerError::FlushFailed(reply.from.clone()))
    }

    async fn apply_worker_reply(
        &self,
        session: &Session,
        state: &mut SessionState,
        reply: &WorkerReplyPayload,
        text: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), EventError> {
        if outcome == DeliveryOutcome::Success {
            self.record_reply(session, state, reply, text).await?;
        }
        let status = outcome.status();
        state.client.server_status = Some(status);
        self.mirror_client(state).await;
        let _ = session.send(Event::new_status(status)?);
        Ok(())
    }

    async fn record_reply(
        &self,
        session: &Session,
        state: &mut SessionState,
        reply: &WorkerReplyPayload,
        text: &str,
    ) -> Result<(), EventError> {
        if let Some(count) = reply.number_of_selected_question {
            state.conversation.prompt_data.number_of_selected_question = count;
        }
        let phase = state.conversation.prompt_data.phase();
        let reasoning = reply.reasoning.clone().unwrap_or_default();
        let message = Message::new(self.config.worker_identity.as_str(), text, phase, reasoning);
        self.record_message(session, state, message).await
    }

    /// Store a worker-produced summary and forward it to a live session.
    #[instrument(skip_all, fields(identity = %reply.from))]
    pub async fn deliver_summary(&self, reply: SummaryReplyPayload) -> Result<(), ManagerError> {
        let room = &reply.from;
        if let Some(session) = self.session_for_room(room) {
            let mut state = session.lock_state().await;
            if state.conversation.id == *room {
                // Update memory too, or the final flush would overwrite the sheet.
                state.conversation.summary_sheet = reply.summary_sheet.clone();
                state.conversation.prompt_data.summary_sent = true;
                if !session.is_removing() {
                    let _ = session.send(Event::new(EventKind::NewSummarySheet, &reply.summary_sheet)?);
                }
                self.store.update_summary_sheet(room, &reply.summary_sheet).await?;
                return Ok(());
            }
        }
        self.store.update_summary_sheet(room, &reply.summary_sheet).await?;
        debug!("summary stored without a live session");
        Ok(())
    }
}
