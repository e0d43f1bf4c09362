//! Handlers for the inbound event set.
//!
//! Each handler is a method on [`ConnectionManager`](super::ConnectionManager)
//! that locks the session state, checks the conversation is still open, and
//! applies the event.

mod feedback;
mod message;
mod room;
mod status;
