//! Settings types.
//!
//! All structs use `#[serde(rename_all = "camelCase", default)]` so a partial
//! user file only needs to name the keys it changes.

use std::path::PathBuf;
use std::time::Duration;

use parley_core::conversation::{LifecyclePolicy, ROLE_SPECIALIST};
use parley_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Session timing and conversation policy.
    pub session: SessionSettings,
    /// Worker queues.
    pub queue: QueueSettings,
    /// Cache mirror bounds.
    pub cache: CacheSettings,
    /// Durable store.
    pub store: StoreSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// Backoff for the final flush on session removal.
    pub retry: RetryConfig,
}

impl RelaySettings {
    /// Reject combinations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.pong_wait_ms < 100 {
            return Err(SettingsError::InvalidValue("session.pongWaitMs must be at least 100".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(SettingsError::InvalidValue("queue.batchSize must be at least 1".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(SettingsError::InvalidValue("cache.maxEntries must be at least 1".into()));
        }
        if self.server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue("server.outboundBuffer must be at least 1".into()));
        }
        if self.store.pool_size == 0 {
            return Err(SettingsError::InvalidValue("store.poolSize must be at least 1".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Origins allowed to open a socket. `"*"` allows any.
    pub allowed_origins: Vec<String>,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Outbound events buffered per session before new ones are dropped.
    pub outbound_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            allowed_origins: vec!["http://localhost:3000".into()],
            max_message_size: 64 * 1024,
            outbound_buffer: 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Session timing and conversation policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Read deadline; refreshed by every pong. Pings go out at 90 % of it.
    pub pong_wait_ms: u64,
    /// How long admission waits for a previous session of the same identity to leave.
    pub eviction_timeout_ms: u64,
    /// Idle time after the last message before a summary is requested.
    pub idle_summary_after_ms: u64,
    /// Turns required before a summary is requested.
    pub summary_min_turns: u32,
    /// Text sent to the worker with a summary request.
    pub summary_prompt: String,
    /// Lifetime of a `processing` conversation.
    pub lifetime_hours: u32,
    /// Role granted the extended lifetime.
    pub privileged_role: String,
    /// Lifetime for the privileged role.
    pub privileged_lifetime_hours: u32,
    /// Greetings recorded when a conversation with no history is first opened.
    pub welcome_messages: Vec<String>,
    /// Author tag for worker replies.
    pub worker_identity: String,
    /// Decode undeclared base64 bodies (compatibility with old workers).
    pub legacy_base64_sniffing: bool,
}

impl SessionSettings {
    /// Read deadline.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Eviction wait bound.
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }

    /// Idle summary threshold.
    pub fn idle_summary_after(&self) -> Duration {
        Duration::from_millis(self.idle_summary_after_ms)
    }

    /// Lifecycle policy derived from the lifetime settings.
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            lifetime: chrono::TimeDelta::hours(i64::from(self.lifetime_hours)),
            privileged_role: self.privileged_role.clone(),
            privileged_lifetime: chrono::TimeDelta::hours(i64::from(self.privileged_lifetime_hours)),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pong_wait_ms: 10_000,
            eviction_timeout_ms: 10_000,
            idle_summary_after_ms: 5 * 60 * 1000,
            summary_min_turns: 2,
            summary_prompt: "summary please".into(),
            lifetime_hours: 24,
            privileged_role: ROLE_SPECIALIST.into(),
            privileged_lifetime_hours: 72,
            welcome_messages: vec![
                "Hello, I'm here to listen. How are you feeling today?".into(),
                "You can tell me anything on your mind, at your own pace.".into(),
            ],
            worker_identity: "assistant".into(),
            legacy_base64_sniffing: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Worker queue names and polling bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Queue receiving prompt and summary requests.
    pub publisher_queue: String,
    /// Queue the relay consumes worker results from.
    pub result_queue: String,
    /// Queue receiving results that failed too often. `None` disables redrive.
    pub dead_letter_queue: Option<String>,
    /// Long-poll bound per receive.
    pub wait_time_ms: u64,
    /// Messages per receive.
    pub batch_size: usize,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout_ms: u64,
    /// Receives before a message is moved to the dead-letter queue.
    pub max_receive_count: u32,
}

impl QueueSettings {
    /// Long-poll bound.
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    /// Visibility timeout.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            publisher_queue: "prompt-requests".into(),
            result_queue: "prompt-results".into(),
            dead_letter_queue: Some("prompt-results-dlq".into()),
            wait_time_ms: 15_000,
            batch_size: 2,
            visibility_timeout_ms: 30_000,
            max_receive_count: 5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache / store / logging
// ─────────────────────────────────────────────────────────────────────────────

/// Cache mirror bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Entry time-to-live in seconds.
    pub ttl_secs: u64,
    /// Entries kept before the least recently used one is evicted.
    pub max_entries: usize,
}

impl CacheSettings {
    /// Entry time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_entries: 10_000,
        }
    }
}

/// Durable store location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `SQLite` database path.
    pub database_path: PathBuf,
    /// Connection pool size.
    pub pool_size: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: crate::loader::parley_home().join("parley.db"),
            pool_size: 8,
        }
    }
}

/// Logging output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
