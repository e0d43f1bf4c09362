//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::events::Event;
use parley_core::ids::ConversationId;
use parley_core::retry::RetryConfig;
use parley_store::{
    ConnectionConfig, MemoryCache, QueuePublisher, SqliteConversationStore, new_in_memory, run_migrations,
};
use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::manager::ConnectionManager;
use crate::websocket::Session;

/// Publisher that keeps every body it was handed.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    bodies: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub(crate) fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    async fn publish(&self, body: String) -> parley_store::Result<()> {
        self.bodies.lock().push(body);
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<SqliteConversationStore>,
    pub cache: Arc<MemoryCache>,
    pub publisher: Arc<RecordingPublisher>,
}

/// One greeting, short eviction wait, near-instant flush retries.
pub(crate) fn test_config() -> ManagerConfig {
    ManagerConfig {
        eviction_timeout: Duration::from_millis(300),
        outbound_buffer: 64,
        welcome_messages: vec!["Hello, how are you today?".into()],
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        },
        ..ManagerConfig::default()
    }
}

pub(crate) fn memory_store() -> SqliteConversationStore {
    let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
    let _ = run_migrations(&pool.get().unwrap()).unwrap();
    SqliteConversationStore::new(pool)
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(test_config())
}

pub(crate) fn fixture_with(config: ManagerConfig) -> Fixture {
    let store = Arc::new(memory_store());
    let cache = Arc::new(MemoryCache::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let manager = Arc::new(ConnectionManager::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config,
    ));
    Fixture {
        manager,
        store,
        cache,
        publisher,
    }
}

/// Admit without a transport; the receiver stands in for the writer loop.
pub(crate) async fn admit(manager: &Arc<ConnectionManager>, identity: &str) -> (Arc<Session>, mpsc::Receiver<Event>) {
    let mut outbound = None;
    let session = manager
        .admit(ConversationId::from(identity), |_, rx| outbound = Some(rx))
        .await
        .unwrap();
    (session, outbound.unwrap())
}

pub(crate) fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) async fn send_message(manager: &ConnectionManager, session: &Session, text: &str) {
    let event = Event::from_json(&serde_json::json!({"type": "send_message", "payload": {"message": text}}).to_string())
        .unwrap();
    manager.route(session, event).await.unwrap();
}
