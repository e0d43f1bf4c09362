//! Error types for the store subsystem.

use thiserror::Error;

/// Errors returned by the store, cache, and queue collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested conversation does not exist.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A conversation with this identity already exists.
    #[error("conversation already exists: {0}")]
    ConversationExists(String),

    /// The cache holds no entry for this conversation.
    #[error("cache miss: {0}")]
    CacheMiss(String),

    /// A queue receipt did not match an in-flight message.
    #[error("unknown receipt for queue '{queue}': {receipt}")]
    UnknownReceipt {
        /// Queue name.
        queue: String,
        /// Receipt presented.
        receipt: String,
    },

    /// Internal error (e.g. a blocking task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = StoreError::ConversationNotFound("chat-1".into());
        assert_eq!(err.to_string(), "conversation not found: chat-1");
    }

    #[test]
    fn receipt_display() {
        let err = StoreError::UnknownReceipt {
            queue: "results".into(),
            receipt: "r-1".into(),
        };
        assert_eq!(err.to_string(), "unknown receipt for queue 'results': r-1");
    }

    #[test]
    fn serde_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
