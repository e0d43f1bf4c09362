//! Queue repository: rows in `queue_messages` keyed by queue name.
//!
//! A message is visible when `visible_at <= now`. Claiming a message hides it
//! for the visibility timeout and hands out a fresh receipt; deleting by
//! receipt acknowledges it. An unacknowledged message becomes visible again
//! and is redelivered.

use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::errors::Result;

/// A message claimed by a receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedRow {
    /// Row ID.
    pub id: i64,
    /// Message body.
    pub body: String,
    /// Receipt for delete.
    pub receipt: String,
    /// How many times the message has been received, including this one.
    pub receive_count: u32,
}

/// Where exhausted messages go.
#[derive(Clone, Copy, Debug)]
pub struct Redrive<'a> {
    /// Target queue.
    pub dead_letter_queue: &'a str,
    /// Receives allowed before the message moves.
    pub max_receive_count: u32,
}

/// Queue repository.
pub struct QueueRepo;

impl QueueRepo {
    /// Append a message, visible immediately.
    pub fn enqueue(conn: &Connection, queue: &str, body: &str, now_ms: i64) -> Result<i64> {
        let _ = conn.execute(
            "INSERT INTO queue_messages (queue, body, visible_at, enqueued_at) VALUES (?1, ?2, ?3, ?3)",
            params![queue, body, now_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim up to `max` visible messages in enqueue order.
    ///
    /// Messages that were already received `max_receive_count` times are moved
    /// to the dead-letter queue instead of being returned.
    pub fn claim(
        conn: &Connection,
        queue: &str,
        max: usize,
        now_ms: i64,
        visibility_ms: i64,
        redrive: Option<Redrive<'_>>,
    ) -> Result<Vec<ClaimedRow>> {
        let tx = conn.unchecked_transaction()?;
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        let candidates: Vec<(i64, String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, body, receive_count FROM queue_messages
                 WHERE queue = ?1 AND visible_at <= ?2 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![queue, now_ms, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, body, receive_count) in candidates {
            if let Some(redrive) = redrive {
                if receive_count >= redrive.max_receive_count {
                    let _ = tx.execute(
                        "UPDATE queue_messages SET queue = ?2, receipt = NULL, visible_at = ?3, receive_count = 0
                         WHERE id = ?1",
                        params![id, redrive.dead_letter_queue, now_ms],
                    )?;
                    tracing::warn!(
                        queue,
                        dead_letter_queue = redrive.dead_letter_queue,
                        message_id = id,
                        receive_count,
                        "message exceeded receive count, moved to dead-letter queue"
                    );
                    continue;
                }
            }
            let receipt = Uuid::now_v7().to_string();
            let _ = tx.execute(
                "UPDATE queue_messages SET receipt = ?2, visible_at = ?3, receive_count = receive_count + 1
                 WHERE id = ?1",
                params![id, receipt, now_ms.saturating_add(visibility_ms)],
            )?;
            claimed.push(ClaimedRow {
                id,
                body,
                receipt,
                receive_count: receive_count + 1,
            });
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Delete an in-flight message by receipt. Returns `false` if the receipt is stale.
    pub fn delete(conn: &Connection, queue: &str, receipt: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM queue_messages WHERE queue = ?1 AND receipt = ?2",
            params![queue, receipt],
        )?;
        Ok(changed > 0)
    }

    /// Messages in a queue, visible or in flight.
    pub fn depth(conn: &Connection, queue: &str) -> Result<usize> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn claim_hides_until_visibility_expires() {
        let conn = setup();
        let _ = QueueRepo::enqueue(&conn, "q", "one", 0).unwrap();

        let first = QueueRepo::claim(&conn, "q", 10, 0, 1_000, None).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(QueueRepo::claim(&conn, "q", 10, 500, 1_000, None).unwrap().is_empty());

        let again = QueueRepo::claim(&conn, "q", 10, 1_000, 1_000, None).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt, first[0].receipt);
    }

    #[test]
    fn claim_respects_batch_and_order() {
        let conn = setup();
        for body in ["a", "b", "c"] {
            let _ = QueueRepo::enqueue(&conn, "q", body, 0).unwrap();
        }
        let _ = QueueRepo::enqueue(&conn, "other", "x", 0).unwrap();
        let batch = QueueRepo::claim(&conn, "q", 2, 0, 1_000, None).unwrap();
        let bodies: Vec<_> = batch.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, ["a", "b"]);
    }

    #[test]
    fn delete_by_receipt_only_once() {
        let conn = setup();
        let _ = QueueRepo::enqueue(&conn, "q", "one", 0).unwrap();
        let row = QueueRepo::claim(&conn, "q", 1, 0, 1_000, None).unwrap().remove(0);
        assert!(QueueRepo::delete(&conn, "q", &row.receipt).unwrap());
        assert!(!QueueRepo::delete(&conn, "q", &row.receipt).unwrap());
        assert_eq!(QueueRepo::depth(&conn, "q").unwrap(), 0);
    }

    #[test]
    fn exhausted_message_moves_to_dead_letter_queue() {
        let conn = setup();
        let _ = QueueRepo::enqueue(&conn, "q", "poison", 0).unwrap();
        let redrive = Some(Redrive {
            dead_letter_queue: "dlq",
            max_receive_count: 2,
        });
        assert_eq!(QueueRepo::claim(&conn, "q", 1, 0, 10, redrive).unwrap().len(), 1);
        assert_eq!(QueueRepo::claim(&conn, "q", 1, 10, 10, redrive).unwrap().len(), 1);
        assert!(QueueRepo::claim(&conn, "q", 1, 20, 10, redrive).unwrap().is_empty());

        assert_eq!(QueueRepo::depth(&conn, "q").unwrap(), 0);
        let dead = QueueRepo::claim(&conn, "dlq", 1, 20, 10, None).unwrap();
        assert_eq!(dead[0].body, "poison");
        assert_eq!(dead[0].receive_count, 1);
    }
}
