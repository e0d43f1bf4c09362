//! `send_status`: the client finished composing, or reports another status.

use parley_core::client::ClientStatus;
use parley_core::events::SendStatusPayload;

use crate::errors::RouteError;
use crate::manager::ConnectionManager;
use crate::websocket::Session;

impl ConnectionManager {
    /// On `client_success`, publish the pending draft as a turn. Any other
    /// status is recorded and mirrored.
    pub(crate) async fn send_status(&self, session: &Session, payload: SendStatusPayload) -> Result<(), RouteError> {
        let mut state = session.lock_state().await;
        self.ensure_open(session, &mut state).await?;

        match payload.status {
            ClientStatus::ClientSuccess => {
                if self.dispatch_turn(session, &mut state).await? {
                    Ok(())
                } else {
                    Err(RouteError::InvalidStatus {
                        status: ClientStatus::ClientSuccess.as_str(),
                        reason: "no pending draft",
                    })
                }
            }
            status => {
                state.client.client_status = Some(status);
                self.mirror_client(&state).await;
                Ok(())
            }
        }
    }
}
