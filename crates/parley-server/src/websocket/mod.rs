//! WebSocket sessions: per-connection state, frame decoding, liveness, and the
//! reader/writer loops.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;

use std::sync::Arc;

use axum::extract::ws::{WebSocket, close_code};
use futures::SinkExt;
use parley_core::ids::ConversationId;
use tracing::warn;

use crate::manager::ConnectionManager;

pub use connection::{Session, SessionState};

/// Admit an upgraded socket under `identity` and start its loops.
///
/// If admission fails before the loops start, the socket is closed with a
/// policy-violation frame naming the reason.
pub async fn accept(socket: WebSocket, identity: ConversationId, manager: Arc<ConnectionManager>) {
    let pong_wait = manager.config().pong_wait;
    let mut socket = Some(socket);
    let admitted = manager
        .admit(identity.clone(), |session, outbound| {
            if let Some(socket) = socket.take() {
                session::spawn_loops(socket, Arc::clone(session), outbound, Arc::clone(&manager), pong_wait);
            }
        })
        .await;

    if let Err(error) = admitted {
        warn!(%identity, %error, "admission failed");
        if let Some(mut socket) = socket {
            let _ = socket
                .send(session::close_frame(close_code::POLICY, &error.to_string()))
                .await;
        }
    }
}
