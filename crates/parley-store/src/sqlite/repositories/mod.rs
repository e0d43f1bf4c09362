//! Stateless repositories. Each method takes `&Connection`.

pub mod conversation;
pub mod queue;

pub use conversation::ConversationRepo;
pub use queue::{ClaimedRow, QueueRepo, Redrive};
