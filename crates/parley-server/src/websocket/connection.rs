//! Per-connection session state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex as SyncMutex, RwLock};
use parley_core::client::ClientState;
use parley_core::conversation::Conversation;
use parley_core::events::Event;
use parley_core::ids::{ConnectionId, ConversationId};
use tokio::sync::{Mutex, MutexGuard, Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::WS_OUTBOUND_DROPS_TOTAL;

/// Conversation and transient client state a session works on.
#[derive(Clone, Debug)]
pub struct SessionState {
    /// Attached conversation. `messages` holds only what has not been flushed yet.
    pub conversation: Conversation,
    /// Draft and status mirrored to the cache.
    pub client: ClientState,
}

/// One admitted connection, or a transient stand-in used for offline delivery.
///
/// Handlers, queue deliveries and the final flush serialise on the state lock.
/// The manager alone decides membership in the active set.
pub struct Session {
    /// Identity the session was admitted under.
    pub identity: ConversationId,
    /// Distinguishes successive sessions of one identity.
    pub connection_id: ConnectionId,
    outbound: Option<mpsc::Sender<Event>>,
    state: Mutex<SessionState>,
    room: RwLock<ConversationId>,
    closed: CancellationToken,
    removing: AtomicBool,
    disconnected: AtomicBool,
    activity: Notify,
    last_activity: SyncMutex<Instant>,
    connected_at: Instant,
    dropped_events: AtomicU64,
}

impl Session {
    /// A live session with an outbound channel of `buffer` events.
    pub fn new(identity: ConversationId, state: SessionState, buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::build(identity, state, Some(tx)), rx)
    }

    /// A transport-less session; everything it sends is discarded.
    pub fn transient(identity: ConversationId, state: SessionState) -> Self {
        Self::build(identity, state, None)
    }

    fn build(identity: ConversationId, state: SessionState, outbound: Option<mpsc::Sender<Event>>) -> Self {
        let now = Instant::now();
        Self {
            identity,
            connection_id: ConnectionId::new(),
            outbound,
            room: RwLock::new(state.conversation.id.clone()),
            state: Mutex::new(state),
            closed: CancellationToken::new(),
            removing: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            activity: Notify::new(),
            last_activity: SyncMutex::new(now),
            connected_at: now,
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Whether the session has a transport.
    pub fn is_live(&self) -> bool {
        self.outbound.is_some()
    }

    /// Enqueue an event for the writer loop without waiting.
    ///
    /// Returns `false` if the event was dropped: transient session, full
    /// channel, or writer gone.
    pub fn send(&self, event: Event) -> bool {
        let Some(tx) = &self.outbound else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                let _ = self.dropped_events.fetch_add(1, Ordering::Relaxed);
                counter!(WS_OUTBOUND_DROPS_TOTAL).increment(1);
                let event = match &err {
                    mpsc::error::TrySendError::Full(e) | mpsc::error::TrySendError::Closed(e) => &e.event_type,
                };
                debug!(identity = %self.identity, event_type = %event, "outbound event dropped");
                false
            }
        }
    }

    /// Lock the conversation and client state.
    pub async fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Conversation the session is currently attached to.
    pub fn room(&self) -> ConversationId {
        self.room.read().clone()
    }

    pub(crate) fn set_room(&self, room: ConversationId) {
        *self.room.write() = room;
    }

    /// Resolves once the session has left the active set.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled when the session has left the active set.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the session has left the active set.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Claim the removal. Only the first caller gets `true`.
    pub(crate) fn begin_removal(&self) -> bool {
        !self.removing.swap(true, Ordering::AcqRel)
    }

    /// Whether removal has started.
    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::Acquire)
    }

    /// Record that a transport loop has ended.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Whether a transport loop has ended.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Note message activity and wake the idle watchdog.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.activity.notify_one();
    }

    /// When the last message was recorded (or the session was created).
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Resolves on the next [`Session::touch`], or at once if one is pending.
    pub(crate) async fn activity(&self) {
        self.activity.notified().await;
    }

    /// Events dropped on a full or closed channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("connection_id", &self.connection_id)
            .field("live", &self.is_live())
            .field("room", &self.room())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::client::ServerStatus;

    fn state(id: &str) -> SessionState {
        SessionState {
            conversation: Conversation::new(ConversationId::from(id)),
            client: ClientState::default(),
        }
    }

    fn status() -> Event {
        Event::new_status(ServerStatus::ServerLoading).unwrap()
    }

    #[tokio::test]
    async fn send_reaches_receiver_in_order() {
        let (session, mut rx) = Session::new(ConversationId::from("chat-1"), state("chat-1"), 8);
        assert!(session.send(status()));
        assert!(session.send(Event::bare(parley_core::events::EventKind::NewUser)));
        assert_eq!(rx.recv().await.unwrap().event_type, "new_status");
        assert_eq!(rx.recv().await.unwrap().event_type, "new_user");
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let (session, _rx) = Session::new(ConversationId::from("chat-1"), state("chat-1"), 1);
        assert!(session.send(status()));
        assert!(!session.send(status()));
        assert!(!session.send(status()));
        assert_eq!(session.drop_count(), 2);
    }

    #[test]
    fn closed_channel_drops() {
        let (session, rx) = Session::new(ConversationId::from("chat-1"), state("chat-1"), 4);
        drop(rx);
        assert!(!session.send(status()));
        assert_eq!(session.drop_count(), 1);
    }

    #[test]
    fn transient_discards_without_counting() {
        let session = Session::transient(ConversationId::from("chat-1"), state("chat-1"));
        assert!(!session.is_live());
        assert!(!session.send(status()));
        assert_eq!(session.drop_count(), 0);
    }

    #[test]
    fn room_follows_conversation_then_moves() {
        let (session, _rx) = Session::new(ConversationId::from("user-1"), state("chat-1"), 1);
        assert_eq!(session.room(), ConversationId::from("chat-1"));
        session.set_room(ConversationId::from("chat-2"));
        assert_eq!(session.room(), ConversationId::from("chat-2"));
    }

    #[test]
    fn removal_is_claimed_once() {
        let session = Session::transient(ConversationId::from("chat-1"), state("chat-1"));
        assert!(!session.is_removing());
        assert!(session.begin_removal());
        assert!(!session.begin_removal());
        assert!(session.is_removing());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let session = std::sync::Arc::new(Session::transient(ConversationId::from("c"), state("c")));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        assert!(!session.is_closed());
        session.close();
        waiter.await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn touch_leaves_a_pending_wakeup() {
        let session = Session::transient(ConversationId::from("c"), state("c"));
        let before = session.last_activity();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_activity() > before);
        // Permit stored by notify_one
        tokio::time::timeout(Duration::from_millis(100), session.activity())
            .await
            .unwrap();
    }
}
