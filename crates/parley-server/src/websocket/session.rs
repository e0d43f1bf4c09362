//! Reader/writer loop pair for an admitted socket.
//!
//! The two loops run as independent tasks and talk only through the session's
//! outbound channel. Whichever ends first asks the manager to remove the
//! session; removal cancels the session, which stops the other loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parley_core::events::Event;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout_at};
use tracing::{debug, instrument, warn};

use super::connection::Session;
use super::handler::decode_frame;
use super::heartbeat::{ReadDeadline, ping_interval};
use crate::manager::ConnectionManager;

/// Spawn the reader and writer loops for `session` over `socket`.
pub fn spawn_loops(
    socket: WebSocket,
    session: Arc<Session>,
    outbound: mpsc::Receiver<Event>,
    manager: Arc<ConnectionManager>,
    pong_wait: Duration,
) {
    let (sink, stream) = socket.split();
    let _ = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&session),
        Arc::clone(&manager),
        ping_interval(pong_wait),
    ));
    let _ = tokio::spawn(read_loop(stream, session, manager, pong_wait));
}

#[instrument(skip_all, fields(identity = %session.identity, connection_id = %session.connection_id))]
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    session: Arc<Session>,
    manager: Arc<ConnectionManager>,
    pong_wait: Duration,
) {
    let mut deadline = ReadDeadline::new(pong_wait);
    loop {
        let next = tokio::select! {
            () = session.closed() => break,
            next = timeout_at(deadline.instant(), stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                debug!("read deadline passed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                debug!(%error, "transport read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let bytes = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            Message::Pong(_) => {
                deadline.refresh();
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => break,
        };
        let event = match decode_frame(bytes) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "undecodable frame, closing session");
                break;
            }
        };
        if let Err(error) = manager.route(&session, event).await {
            warn!(%error, "event rejected");
        }
    }
    session.mark_disconnected();
    manager.remove(&session).await;
}

#[instrument(skip_all, fields(identity = %session.identity, connection_id = %session.connection_id))]
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Event>,
    session: Arc<Session>,
    manager: Arc<ConnectionManager>,
    ping_every: Duration,
) {
    let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
    loop {
        tokio::select! {
            () = session.closed() => {
                // Deliver what was queued before removal, then say goodbye
                while let Ok(event) = outbound.try_recv() {
                    if write_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(close_frame(close_code::NORMAL, "session closed")).await;
                break;
            }
            next = outbound.recv() => {
                let Some(event) = next else {
                    let _ = sink.send(close_frame(close_code::NORMAL, "session closed")).await;
                    break;
                };
                if write_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!("ping failed");
                    break;
                }
            }
        }
    }
    session.mark_disconnected();
    manager.remove(&session).await;
}

async fn write_event(sink: &mut SplitSink<WebSocket, Message>, event: &Event) -> Result<(), axum::Error> {
    let text = match event.to_json() {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, event_type = %event.event_type, "dropping unencodable event");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await.inspect_err(|error| {
        debug!(%error, "transport write failed");
    })
}

/// A close frame with `code` and `reason`.
pub(crate) fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from(reason),
    }))
}
