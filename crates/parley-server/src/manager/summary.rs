//! Idle-summary watchdog.
//!
//! One task per admitted session sleeps until the conversation has been idle
//! for `idle_summary_after`. Every recorded message pushes the deadline out.
//! When it fires and the conversation has enough turns, one
//! `send_summary_request` is published; the watchdog then waits for new
//! activity before arming again.

use std::sync::{Arc, Weak};

use parley_core::events::{Event, EventKind, WorkerRequestPayload};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::ConnectionManager;
use crate::websocket::Session;

pub(super) fn spawn_watchdog(manager: Weak<ConnectionManager>, session: Arc<Session>) {
    let _ = tokio::spawn(watch(manager, session));
}

async fn watch(manager: Weak<ConnectionManager>, session: Arc<Session>) {
    let Some(idle_after) = manager.upgrade().map(|m| m.config.idle_summary_after) else {
        return;
    };
    loop {
        let due = session.last_activity() + idle_after;
        tokio::select! {
            () = session.closed() => return,
            () = session.activity() => continue,
            () = sleep_until(due) => {}
        }
        if session.last_activity() + idle_after > Instant::now() {
            continue;
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.request_summary(&session).await;
        drop(manager);

        tokio::select! {
            () = session.closed() => return,
            () = session.activity() => {}
        }
    }
}

impl ConnectionManager {
    /// Publish a summary request for an idle conversation, once.
    pub(crate) async fn request_summary(&self, session: &Session) {
        let mut state = session.lock_state().await;
        let prompt = &state.conversation.prompt_data;
        if session.is_removing() || prompt.summary_sent || prompt.turn < self.config.summary_min_turns {
            debug!(identity = %session.identity, turn = prompt.turn, "summary not due");
            return;
        }

        let request = WorkerRequestPayload {
            message: self.config.summary_prompt.clone(),
            from: state.conversation.id.clone(),
        };
        let body = match Event::new(EventKind::SendSummaryRequest, &request).and_then(|event| event.to_json()) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "could not encode summary request");
                return;
            }
        };
        if let Err(error) = self.publisher.publish(body).await {
            warn!(identity = %session.identity, %error, "summary request not published");
            return;
        }

        state.conversation.prompt_data.summary_sent = true;
        self.mirror_prompt_data(&state.conversation).await;
        info!(identity = %session.identity, room = %state.conversation.id, "summary requested");
    }
}
