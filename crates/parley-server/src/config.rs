//! Runtime configuration derived from [`RelaySettings`].

use std::time::Duration;

use parley_core::conversation::LifecyclePolicy;
use parley_core::retry::RetryConfig;
use parley_settings::RelaySettings;
use serde::{Deserialize, Serialize};

/// Origin entry that allows any origin.
pub const ANY_ORIGIN: &str = "*";

/// HTTP surface configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Origins allowed to open a socket. `"*"` allows any.
    pub allowed_origins: Vec<String>,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Take the `server` section of the settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            allowed_origins: settings.server.allowed_origins.clone(),
            max_message_size: settings.server.max_message_size,
        }
    }

    /// Whether an upgrade request with this `Origin` header may proceed.
    ///
    /// A request without an `Origin` is not a cross-site browser request and is
    /// accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == ANY_ORIGIN || allowed.eq_ignore_ascii_case(origin))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            allowed_origins: vec![ANY_ORIGIN.into()],
            max_message_size: 64 * 1024,
        }
    }
}

/// Connection manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    /// Bound on the wait for a previous session of the same identity.
    pub eviction_timeout: Duration,
    /// Outbound channel capacity per session.
    pub outbound_buffer: usize,
    /// Idle time before a summary is requested.
    pub idle_summary_after: Duration,
    /// Turns required before a summary is requested.
    pub summary_min_turns: u32,
    /// Text of the summary request.
    pub summary_prompt: String,
    /// Conversation lifetimes.
    pub lifecycle: LifecyclePolicy,
    /// Greetings for a conversation with no history.
    pub welcome_messages: Vec<String>,
    /// Author tag of worker replies.
    pub worker_identity: String,
    /// Decode undeclared base64 bodies.
    pub legacy_base64_sniffing: bool,
    /// Backoff for the final flush.
    pub retry: RetryConfig,
}

impl ManagerConfig {
    /// Take the `session`, `server.outboundBuffer` and `retry` settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let session = &settings.session;
        Self {
            pong_wait: session.pong_wait(),
            eviction_timeout: session.eviction_timeout(),
            outbound_buffer: settings.server.outbound_buffer,
            idle_summary_after: session.idle_summary_after(),
            summary_min_turns: session.summary_min_turns,
            summary_prompt: session.summary_prompt.clone(),
            lifecycle: session.lifecycle_policy(),
            welcome_messages: session.welcome_messages.clone(),
            worker_identity: session.worker_identity.clone(),
            legacy_base64_sniffing: session.legacy_base64_sniffing,
            retry: settings.retry.clone(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

/// Queue bridge polling configuration.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Messages per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl BridgeConfig {
    /// Take the `queue` settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            batch_size: settings.queue.batch_size,
            wait: settings.queue.wait_time(),
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            wait: Duration::from_secs(15),
            error_backoff: Duration::from_secs(1),
        }
    }
}
