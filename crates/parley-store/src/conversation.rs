//! Durable conversation store.
//!
//! [`ConversationStore`] is the authoritative persistence seam the connection
//! manager calls. [`SqliteConversationStore`] runs the stateless
//! [`ConversationRepo`] on the blocking pool.

use async_trait::async_trait;
use parley_core::conversation::{Conversation, Feedback, Message, SummarySheet};
use parley_core::ids::ConversationId;
use rusqlite::Connection;

use crate::errors::{Result, StoreError};
use crate::sqlite::ConnectionPool;
use crate::sqlite::repositories::ConversationRepo;

/// Authoritative conversation persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation with its full history.
    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Create a conversation. Fails if the identity is taken.
    async fn create(&self, conversation: &Conversation) -> Result<()>;

    /// Overwrite metadata (status, prompt data, feedback, summary). Messages are untouched.
    async fn update(&self, conversation: &Conversation) -> Result<()>;

    /// Append messages to an existing conversation.
    async fn append_messages(&self, id: &ConversationId, messages: &[Message]) -> Result<()>;

    /// Upsert metadata and append the messages `conversation` carries, atomically.
    ///
    /// Message IDs already stored are skipped, so repeating a flush is harmless.
    async fn flush(&self, conversation: &Conversation) -> Result<()>;

    /// Replace the conversation-level feedback slot.
    async fn update_conversation_feedback(&self, id: &ConversationId, feedback: &Feedback) -> Result<()>;

    /// Replace the feedback slot of the stored message owning `feedback.id`.
    ///
    /// Returns `false` if no stored message owns that slot.
    async fn update_message_feedback(&self, feedback: &Feedback) -> Result<bool>;

    /// Replace the summary sheet.
    async fn update_summary_sheet(&self, id: &ConversationId, sheet: &SummarySheet) -> Result<()>;

    /// Delete a conversation. Returns `false` if it did not exist.
    async fn delete(&self, id: &ConversationId) -> Result<bool>;
}

/// [`ConversationStore`] backed by `SQLite`.
#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: ConnectionPool,
}

impl SqliteConversationStore {
    /// Wrap a migrated pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let id = id.clone();
        self.with_conn(move |conn| ConversationRepo::get(conn, &id)).await
    }

    async fn create(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| ConversationRepo::insert(conn, &conversation)).await
    }

    async fn update(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| ConversationRepo::update(conn, &conversation)).await
    }

    async fn append_messages(&self, id: &ConversationId, messages: &[Message]) -> Result<()> {
        let id = id.clone();
        let messages = messages.to_vec();
        self.with_conn(move |conn| ConversationRepo::append_messages(conn, &id, &messages)).await
    }

    async fn flush(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| ConversationRepo::flush(conn, &conversation)).await
    }

    async fn update_conversation_feedback(&self, id: &ConversationId, feedback: &Feedback) -> Result<()> {
        let id = id.clone();
        let feedback = feedback.clone();
        self.with_conn(move |conn| ConversationRepo::update_feedback(conn, &id, &feedback)).await
    }

    async fn update_message_feedback(&self, feedback: &Feedback) -> Result<bool> {
        let feedback = feedback.clone();
        self.with_conn(move |conn| ConversationRepo::update_message_feedback(conn, &feedback)).await
    }

    async fn update_summary_sheet(&self, id: &ConversationId, sheet: &SummarySheet) -> Result<()> {
        let id = id.clone();
        let sheet = sheet.clone();
        self.with_conn(move |conn| ConversationRepo::update_summary_sheet(conn, &id, &sheet)).await
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool> {
        let id = id.clone();
        self.with_conn(move |conn| ConversationRepo::delete(conn, &id)).await
    }
}
