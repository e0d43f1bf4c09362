//! Connection manager: the active session set and everything that touches it.
//!
//! The manager owns a map from identity to [`Session`]. At most one session
//! per identity is in the map at any instant; admission inserts last, removal
//! flushes first and cancels the session's `closed` token last, so a waiter in
//! [`ConnectionManager::check_existing`] always observes the flushed state.
//!
//! Lock discipline: the map is guarded by a `parking_lot` mutex that is never
//! held across an await. Conversation state is guarded per session by its own
//! async mutex (see [`Session::lock_state`]); handlers, queue deliveries and
//! the final flush serialise on it.

pub mod delivery;
pub mod handlers;
pub mod router;
mod summary;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use parley_core::EventError;
use parley_core::client::{ClientState, ClientStatus, ServerStatus};
use parley_core::conversation::{Conversation, Message, Phase, ROLE_SYSTEM};
use parley_core::events::{Event, EventKind, PresencePayload, WorkerRequestPayload};
use parley_core::ids::ConversationId;
use parley_store::{CacheMirror, ConversationStore, QueuePublisher, StoreError};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::errors::{ManagerError, RouteError};
use crate::metrics::{
    RELAY_TURNS_DISPATCHED_TOTAL, SESSION_FLUSH_FAILURES_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::websocket::{Session, SessionState};

pub use delivery::DeliveryOutcome;
pub use router::InboundEvent;

/// Owns the active session set and orchestrates admission, removal, routing
/// and fan-out.
pub struct ConnectionManager {
    sessions: Mutex<HashMap<ConversationId, Arc<Session>>>,
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn CacheMirror>,
    publisher: Arc<dyn QueuePublisher>,
    config: ManagerConfig,
}

impl ConnectionManager {
    /// Create a manager over its collaborators.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn CacheMirror>,
        publisher: Arc<dyn QueuePublisher>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            cache,
            publisher,
            config,
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The session admitted under `identity`, if any.
    pub fn session(&self, identity: &ConversationId) -> Option<Arc<Session>> {
        self.sessions.lock().get(identity).cloned()
    }

    /// Identities of the sessions in the set, sorted.
    pub fn identities(&self) -> Vec<ConversationId> {
        let mut identities: Vec<_> = self.sessions.lock().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Number of sessions in the set.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Number of sessions in the set that have a transport.
    pub fn connection_count(&self) -> usize {
        self.sessions.lock().values().filter(|s| s.is_live()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait until no session for `identity` remains in the set.
    ///
    /// Fails with [`ManagerError::EvictionTimeout`] once the configured bound
    /// elapses.
    pub async fn check_existing(&self, identity: &ConversationId) -> Result<(), ManagerError> {
        let deadline = Instant::now() + self.config.eviction_timeout;
        loop {
            let Some(existing) = self.session(identity) else {
                return Ok(());
            };
            debug!(%identity, connection_id = %existing.connection_id, "waiting for prior session to leave");
            if timeout_at(deadline, existing.closed()).await.is_err() {
                return Err(ManagerError::EvictionTimeout {
                    identity: identity.clone(),
                    waited: self.config.eviction_timeout,
                });
            }
        }
    }

    /// [`check_existing`](Self::check_existing) plus a read-only lifecycle
    /// check, for clients that want to know before upgrading.
    pub async fn preflight(&self, identity: &ConversationId) -> Result<(), ManagerError> {
        self.check_existing(identity).await?;
        if let Some(mut conversation) = self.store.get(identity).await? {
            let _ = conversation.expire_if_due(Utc::now(), &self.config.lifecycle);
            if conversation.is_closed() {
                return Err(ManagerError::ConversationClosed {
                    identity: identity.clone(),
                    status: conversation.status,
                });
            }
        }
        Ok(())
    }

    /// Admit a session for `identity`.
    ///
    /// Loads (or creates) the conversation, primes the cache mirror, builds the
    /// session and hands it with its outbound receiver to `start`, which must
    /// start the transport loops. Greetings are recorded next, and insertion
    /// into the set is the last step.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn admit<F>(self: &Arc<Self>, identity: ConversationId, start: F) -> Result<Arc<Session>, ManagerError>
    where
        F: FnOnce(&Arc<Session>, mpsc::Receiver<Event>) + Send,
    {
        let mut conversation = self.load_conversation(&identity).await?;
        self.open_for_admission(&mut conversation).await?;
        let had_history = !conversation.messages.is_empty();
        let state = self.prime(conversation).await;
        let resume = state.client.server_status;

        let (session, outbound) = Session::new(identity.clone(), state, self.config.outbound_buffer);
        let session = Arc::new(session);
        start(&session, outbound);

        if let Err(error) = self.greet(&session, had_history, resume).await {
            self.abandon(&session).await;
            return Err(error);
        }
        if let Err(occupant) = self.try_insert(&session) {
            warn!(occupant = %occupant.connection_id, "identity taken while admitting");
            self.abandon(&session).await;
            return Err(ManagerError::AlreadyConnected(identity));
        }

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(connection_id = %session.connection_id, "session admitted");

        self.announce(&session, EventKind::NewUser, &session.room());
        summary::spawn_watchdog(Arc::downgrade(self), Arc::clone(&session));

        // A loop that ended before insertion could not remove the session.
        if session.is_disconnected() {
            self.remove(&session).await;
        }
        Ok(session)
    }

    async fn open_for_admission(&self, conversation: &mut Conversation) -> Result<(), ManagerError> {
        let now = Utc::now();
        if conversation.expire_if_due(now, &self.config.lifecycle) {
            self.store.update(conversation).await?;
        }
        if conversation.is_closed() {
            return Err(ManagerError::ConversationClosed {
                identity: conversation.id.clone(),
                status: conversation.status,
            });
        }
        if conversation.begin(now) {
            self.store.update(conversation).await?;
        }
        Ok(())
    }

    async fn greet(&self, session: &Session, had_history: bool, resume: Option<ServerStatus>) -> Result<(), ManagerError> {
        let mut state = session.lock_state().await;
        if !had_history {
            for line in &self.config.welcome_messages {
                let message = Message::new(ROLE_SYSTEM, line.as_str(), Phase::Rapport, "-");
                self.record_message(session, &mut state, message).await?;
            }
        }
        if let Some(status) = resume {
            let _ = session.send(Event::new_status(status)?);
        }
        Ok(())
    }

    /// Persist and close a session that never made it into the set.
    async fn abandon(&self, session: &Session) {
        let mut state = session.lock_state().await;
        let _ = self.flush(&mut state.conversation).await;
        drop(state);
        session.close();
    }

    fn try_insert(&self, session: &Arc<Session>) -> Result<(), Arc<Session>> {
        let mut sessions = self.sessions.lock();
        match sessions.entry(session.identity.clone()) {
            Entry::Occupied(occupied) => Err(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(Arc::clone(session));
                Ok(())
            }
        }
    }

    fn is_member(&self, session: &Session) -> bool {
        self.sessions
            .lock()
            .get(&session.identity)
            .is_some_and(|s| s.connection_id == session.connection_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove a session from the set.
    ///
    /// Dispatches a draft the client was still composing, flushes the
    /// conversation (with retry), leaves the set, announces the departure and
    /// finally closes the session. Removing a session that is not in the set,
    /// or a second time, does nothing.
    #[instrument(skip_all, fields(identity = %session.identity, connection_id = %session.connection_id))]
    pub async fn remove(&self, session: &Session) {
        if !self.is_member(session) || !session.begin_removal() {
            return;
        }

        let mut state = session.lock_state().await;
        if session.is_live() && state.client.is_loading() {
            match self.dispatch_turn(session, &mut state).await {
                Ok(true) => debug!("dispatched pending draft on removal"),
                Ok(false) => {}
                Err(error) => warn!(%error, "could not dispatch pending draft"),
            }
        }
        let _ = self.flush(&mut state.conversation).await;
        let room = state.conversation.id.clone();

        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&session.identity)
                .is_some_and(|s| s.connection_id == session.connection_id)
            {
                let _ = sessions.remove(&session.identity);
            }
        }
        drop(state);

        if session.is_live() {
            self.announce(session, EventKind::LeaveUser, &room);
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            histogram!(WS_CONNECTION_DURATION_SECONDS).record(session.age().as_secs_f64());
            info!(dropped_events = session.drop_count(), "session removed");
        }
        session.close();
    }

    /// Remove every session, concurrently.
    pub async fn drain(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "draining sessions");
        let _ = join_all(sessions.iter().map(|session| self.remove(session))).await;
    }

    /// Mark a conversation terminated and evict the session admitted under it.
    ///
    /// Returns whether a session was evicted.
    pub async fn terminate(&self, identity: &ConversationId) -> Result<bool, ManagerError> {
        let attached: Vec<_> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.room() == *identity)
            .cloned()
            .collect();
        for session in &attached {
            let mut state = session.lock_state().await;
            if state.conversation.id == *identity {
                state.conversation.terminate();
            }
        }

        let evicted = match self.session(identity) {
            Some(session) => {
                self.remove(&session).await;
                true
            }
            None => false,
        };

        let Some(mut conversation) = self.store.get(identity).await? else {
            return if evicted {
                Ok(true)
            } else {
                Err(ManagerError::NotFound(identity.clone()))
            };
        };
        conversation.terminate();
        self.store.update(&conversation).await?;
        mirrored("put_conversation", identity, self.cache.put_conversation(&conversation).await);
        info!(%identity, evicted, "conversation terminated");
        Ok(evicted)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue `event` on every session for which `predicate` holds.
    ///
    /// Never blocks: a full channel drops the event for that session only.
    /// Returns the number of sessions that accepted it.
    pub fn broadcast<P>(&self, event: &Event, predicate: P) -> usize
    where
        P: Fn(&Session) -> bool,
    {
        let targets: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        targets.iter().filter(|s| s.send(event.clone())).count()
    }

    fn announce(&self, session: &Session, kind: EventKind, room: &ConversationId) {
        let payload = PresencePayload {
            identity: session.identity.clone(),
            room: room.clone(),
        };
        match Event::new(kind, &payload) {
            Ok(event) => {
                let reached = self.broadcast(&event, |other| {
                    other.connection_id != session.connection_id && other.room() == *room
                });
                debug!(event_type = %kind, %room, reached, "presence announced");
            }
            Err(error) => warn!(%error, "could not encode presence event"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shared handler plumbing
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a message to the session's conversation and fan it out.
    ///
    /// The message goes to the session itself and to every other session in
    /// the same room. Re-arms the idle watchdog.
    pub(crate) async fn record_message(
        &self,
        session: &Session,
        state: &mut SessionState,
        message: Message,
    ) -> Result<(), EventError> {
        let event = Event::new_message(&message)?;
        let room = state.conversation.id.clone();
        mirrored("append_message", &room, self.cache.append_message(&room, &message).await);
        state.conversation.record(message);
        self.mirror_prompt_data(&state.conversation).await;

        let _ = session.send(event.clone());
        let _ = self.broadcast(&event, |other| {
            other.connection_id != session.connection_id && other.room() == room
        });
        session.touch();
        Ok(())
    }

    /// Publish the pending draft as a prompt request.
    ///
    /// Returns `false` when there is no draft. On publish failure the draft is
    /// kept for the next attempt.
    pub(crate) async fn dispatch_turn(&self, session: &Session, state: &mut SessionState) -> Result<bool, RouteError> {
        if state.client.message.is_empty() {
            return Ok(false);
        }
        let request = WorkerRequestPayload {
            message: state.client.message.clone(),
            from: state.conversation.id.clone(),
        };
        let body = Event::new(EventKind::SendMessageToPrompt, &request)?.to_json()?;
        self.publisher.publish(body).await.map_err(RouteError::Publish)?;

        let _ = state.client.take_draft();
        state.conversation.prompt_data.turn += 1;
        state.client.client_status = Some(ClientStatus::ClientSuccess);
        state.client.server_status = Some(ServerStatus::ServerLoading);
        self.mirror_prompt_data(&state.conversation).await;
        self.mirror_client(state).await;

        let _ = session.send(Event::new_status(ServerStatus::ServerLoading)?);
        counter!(RELAY_TURNS_DISPATCHED_TOTAL).increment(1);
        debug!(turn = state.conversation.prompt_data.turn, "turn dispatched");
        Ok(true)
    }

    /// Refuse work on a closing session or a closed conversation.
    pub(crate) async fn ensure_open(&self, session: &Session, state: &mut SessionState) -> Result<(), RouteError> {
        if session.is_removing() {
            return Err(RouteError::SessionClosing);
        }
        if state.conversation.expire_if_due(Utc::now(), &self.config.lifecycle) {
            self.store.update(&state.conversation).await?;
        }
        if state.conversation.is_closed() {
            return Err(RouteError::ConversationClosed(state.conversation.id.clone()));
        }
        Ok(())
    }

    /// Load a conversation with its history, creating it if absent.
    pub(crate) async fn load_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        if let Some(conversation) = self.store.get(id).await? {
            return Ok(conversation);
        }
        let fresh = Conversation::new(id.clone());
        match self.store.create(&fresh).await {
            Ok(()) => Ok(fresh),
            Err(StoreError::ConversationExists(_)) => self
                .store
                .get(id)
                .await?
                .ok_or_else(|| StoreError::ConversationNotFound(id.to_string())),
            Err(error) => Err(error),
        }
    }

    /// Mirror a freshly loaded conversation and build session state from it.
    ///
    /// Cached client state wins over defaults. The returned conversation
    /// carries no messages: history is already durable.
    pub(crate) async fn prime(&self, mut conversation: Conversation) -> SessionState {
        mirrored("put_conversation", &conversation.id, self.cache.put_conversation(&conversation).await);
        let client = match self.cache.get(&conversation.id).await {
            Ok(Some(entry)) => entry.client,
            Ok(None) => ClientState::default(),
            Err(error) => {
                warn!(identity = %conversation.id, %error, "cache read failed");
                ClientState::default()
            }
        };
        conversation.messages.clear();
        SessionState { conversation, client }
    }

    /// Flush unflushed messages and metadata, retrying with backoff.
    ///
    /// Clears the flushed messages on success.
    pub(crate) async fn flush(&self, conversation: &mut Conversation) -> Result<(), StoreError> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.store.flush(conversation).await {
                Ok(()) => {
                    conversation.messages.clear();
                    return Ok(());
                }
                Err(error) if attempt < retry.max_retries => {
                    let delay = retry.delay(attempt, rand::random());
                    warn!(identity = %conversation.id, attempt, %error, ?delay, "flush failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(identity = %conversation.id, %error, "flush failed, giving up");
                    counter!(SESSION_FLUSH_FAILURES_TOTAL).increment(1);
                    return Err(error);
                }
            }
        }
    }

    pub(crate) async fn mirror_client(&self, state: &SessionState) {
        let id = &state.conversation.id;
        mirrored("put_client_state", id, self.cache.put_client_state(id, &state.client).await);
    }

    pub(crate) async fn mirror_prompt_data(&self, conversation: &Conversation) {
        let id = &conversation.id;
        mirrored("put_prompt_data", id, self.cache.put_prompt_data(id, &conversation.prompt_data).await);
    }
}

/// Log a failed cache write. The mirror is best-effort.
fn mirrored(op: &'static str, id: &ConversationId, result: parley_store::Result<()>) {
    if let Err(error) = result {
        debug!(op, identity = %id, %error, "cache mirror write failed");
    }
}
