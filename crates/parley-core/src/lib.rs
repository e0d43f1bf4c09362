//! # parley-core
//!
//! Foundation types shared by every Parley crate:
//!
//! - Branded ID newtypes ([`ids`])
//! - The conversation model: messages, feedback, prompt bookkeeping, lifecycle ([`conversation`])
//! - Transient per-client status mirrored to the cache ([`client`])
//! - The wire [`events::Event`] envelope and its typed payloads
//! - Message body decoding ([`content`])
//! - Backoff math ([`retry`]) and tracing bootstrap ([`logging`])

#![deny(unsafe_code)]

pub mod client;
pub mod content;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod retry;

pub use errors::EventError;
