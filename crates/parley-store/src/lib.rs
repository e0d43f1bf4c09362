//! # parley-store
//!
//! The relay's external collaborators, each behind a narrow async trait:
//!
//! - [`ConversationStore`]: authoritative conversation persistence
//!   ([`SqliteConversationStore`])
//! - [`CacheMirror`]: best-effort copy of conversation + client state
//!   ([`MemoryCache`], LRU + TTL bounded)
//! - [`QueuePublisher`] / [`QueueConsumer`]: worker queues with long-poll
//!   receive, explicit delete, visibility timeout, and dead-letter redrive
//!   ([`SqliteQueue`])

#![deny(unsafe_code)]

pub mod cache;
pub mod conversation;
pub mod errors;
pub mod queue;
pub mod sqlite;

pub use cache::{CacheEntry, CacheMirror, CacheStats, MemoryCache, MemoryCacheConfig};
pub use conversation::{ConversationStore, SqliteConversationStore};
pub use errors::{Result, StoreError};
pub use queue::{QueueConsumer, QueueMessage, QueuePublisher, RedrivePolicy, SqliteQueue, SqliteQueueConfig};
pub use sqlite::{ConnectionConfig, ConnectionPool, new_file, new_in_memory, run_migrations};
