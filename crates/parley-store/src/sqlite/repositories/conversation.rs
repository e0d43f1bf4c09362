//! Conversation repository: metadata rows plus append-only message rows.
//!
//! Conversation metadata is stored as JSON without the message list; messages
//! live in their own table ordered by `seq`. Message inserts ignore duplicate
//! IDs so a replayed flush does not duplicate history.

use chrono::Utc;
use parley_core::conversation::{Conversation, Feedback, Message, SummarySheet};
use parley_core::ids::{ConversationId, FeedbackId};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::{Result, StoreError};

/// Conversation repository.
pub struct ConversationRepo;

impl ConversationRepo {
    /// Load a conversation with its full message history.
    pub fn get(conn: &Connection, id: &ConversationId) -> Result<Option<Conversation>> {
        let data: Option<String> = conn
            .query_row("SELECT data FROM conversations WHERE id = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(data) = data else {
            return Ok(None);
        };
        let mut conversation: Conversation = serde_json::from_str(&data)?;
        conversation.messages = Self::messages(conn, id)?;
        Ok(Some(conversation))
    }

    /// Messages of a conversation in acceptance order.
    pub fn messages(conn: &Connection, id: &ConversationId) -> Result<Vec<Message>> {
        let mut stmt = conn.prepare("SELECT data FROM messages WHERE conversation_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![id.as_str()], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    /// Insert a new conversation and any messages it carries.
    pub fn insert(conn: &Connection, conversation: &Conversation) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations (id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                conversation.id.as_str(),
                conversation.status.as_str(),
                metadata_json(conversation)?,
                now
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::ConversationExists(conversation.id.to_string()));
        }
        Self::insert_messages(&tx, &conversation.id, &conversation.messages)?;
        tx.commit()?;
        Ok(())
    }

    /// Overwrite conversation metadata. Messages are untouched.
    pub fn update(conn: &Connection, conversation: &Conversation) -> Result<()> {
        let changed = conn.execute(
            "UPDATE conversations SET status = ?2, data = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                conversation.id.as_str(),
                conversation.status.as_str(),
                metadata_json(conversation)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(conversation.id.to_string()));
        }
        Ok(())
    }

    /// Upsert metadata and append the messages the conversation carries, atomically.
    pub fn flush(conn: &Connection, conversation: &Conversation) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let _ = tx.execute(
            "INSERT INTO conversations (id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data,
                                           updated_at = excluded.updated_at",
            params![
                conversation.id.as_str(),
                conversation.status.as_str(),
                metadata_json(conversation)?,
                now
            ],
        )?;
        Self::insert_messages(&tx, &conversation.id, &conversation.messages)?;
        tx.commit()?;
        Ok(())
    }

    /// Append messages to an existing conversation.
    pub fn append_messages(conn: &Connection, id: &ConversationId, messages: &[Message]) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        Self::touch(&tx, id)?;
        Self::insert_messages(&tx, id, messages)?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the conversation-level feedback slot.
    pub fn update_feedback(conn: &Connection, id: &ConversationId, feedback: &Feedback) -> Result<()> {
        Self::set_json_field(conn, id, "$.feedback", &serde_json::to_string(feedback)?)
    }

    /// Replace the summary sheet.
    pub fn update_summary_sheet(conn: &Connection, id: &ConversationId, sheet: &SummarySheet) -> Result<()> {
        Self::set_json_field(conn, id, "$.summarySheet", &serde_json::to_string(sheet)?)
    }

    /// Replace the feedback slot of the message whose slot ID matches.
    ///
    /// Returns `false` if no stored message has that feedback ID.
    pub fn update_message_feedback(conn: &Connection, feedback: &Feedback) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE messages SET data = json_set(data, '$.feedback', json(?2)) WHERE feedback_id = ?1",
            params![feedback.id.as_str(), serde_json::to_string(feedback)?],
        )?;
        Ok(changed > 0)
    }

    /// Whether any stored message has this feedback slot.
    pub fn has_message_feedback(conn: &Connection, feedback_id: &FeedbackId) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM messages WHERE feedback_id = ?1 LIMIT 1",
                params![feedback_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a conversation and its messages. Returns `false` if absent.
    pub fn delete(conn: &Connection, id: &ConversationId) -> Result<bool> {
        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id.as_str()])?;
        let changed = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    fn insert_messages(conn: &Connection, id: &ConversationId, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO messages (id, conversation_id, feedback_id, data) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for message in messages {
            let _ = stmt.execute(params![
                message.id.as_str(),
                id.as_str(),
                message.feedback.id.as_str(),
                serde_json::to_string(message)?
            ])?;
        }
        Ok(())
    }

    fn touch(conn: &Connection, id: &ConversationId) -> Result<()> {
        let changed = conn.execute(
            "UPDATE conversations SET updated_at = ?2, data = json_set(data, '$.updatedAt', ?2) WHERE id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_json_field(conn: &Connection, id: &ConversationId, path: &str, json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE conversations
             SET data = json_set(json_set(data, ?2, json(?3)), '$.updatedAt', ?4), updated_at = ?4
             WHERE id = ?1",
            params![id.as_str(), path, json, now],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Conversation JSON without the message list, stamped with the write time.
fn metadata_json(conversation: &Conversation) -> Result<String> {
    let mut value = serde_json::to_value(conversation)?;
    if let Value::Object(map) = &mut value {
        let _ = map.insert("messages".into(), Value::Array(Vec::new()));
        let _ = map.insert("updatedAt".into(), serde_json::to_value(Utc::now())?);
    }
    Ok(serde_json::to_string(&value)?)
}
