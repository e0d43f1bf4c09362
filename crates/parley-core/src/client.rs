//! Transient client/server status tracked per conversation.
//!
//! This is the state the cache mirror carries between sessions: the pending
//! draft a client has typed but not yet submitted, and the last known status
//! on each side of the relay.

use serde::{Deserialize, Serialize};

/// Client-side composition status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// The client is still composing (draft accumulating).
    ClientLoading,
    /// The client finished composing; the draft may be dispatched.
    ClientSuccess,
    /// The client reported a failure.
    ClientError,
}

impl ClientStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientLoading => "client_loading",
            Self::ClientSuccess => "client_success",
            Self::ClientError => "client_error",
        }
    }
}

/// Status of the asynchronous worker turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// A prompt request is in flight.
    ServerLoading,
    /// The worker replied.
    ServerSuccess,
    /// The worker failed (dead-lettered result).
    ServerError,
}

impl ServerStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerLoading => "server_loading",
            Self::ServerSuccess => "server_success",
            Self::ServerError => "server_error",
        }
    }
}

/// Per-conversation transient state mirrored to the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientState {
    /// Pending draft, space-joined fragments of unsent user text.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last client status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_status: Option<ClientStatus>,
    /// Last server status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_status: Option<ServerStatus>,
}

impl ClientState {
    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.client_status.is_none() && self.server_status.is_none()
    }

    /// Whether the client is mid-composition.
    pub fn is_loading(&self) -> bool {
        self.client_status == Some(ClientStatus::ClientLoading)
    }

    /// Append a fragment to the pending draft.
    pub fn append_draft(&mut self, text: &str) {
        if self.message.is_empty() {
            self.message.push_str(text);
        } else {
            self.message.push(' ');
            self.message.push_str(text);
        }
    }

    /// Take the pending draft, leaving it empty.
    pub fn take_draft(&mut self) -> String {
        std::mem::take(&mut self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_fragments_are_space_joined() {
        let mut state = ClientState::default();
        state.append_draft("hello");
        state.append_draft("there");
        assert_eq!(state.message, "hello there");
        assert_eq!(state.take_draft(), "hello there");
        assert!(state.message.is_empty());
    }

    #[test]
    fn empty_state_serializes_to_empty_object() {
        let json = serde_json::to_value(ClientState::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn wire_names() {
        let state = ClientState {
            message: "hi".into(),
            client_status: Some(ClientStatus::ClientLoading),
            server_status: Some(ServerStatus::ServerError),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["clientStatus"], "client_loading");
        assert_eq!(json["serverStatus"], "server_error");
        assert_eq!(ClientStatus::ClientSuccess.as_str(), "client_success");
        assert_eq!(ServerStatus::ServerLoading.as_str(), "server_loading");
    }

    #[test]
    fn is_loading_only_for_client_loading() {
        let mut state = ClientState::default();
        assert!(!state.is_loading());
        state.client_status = Some(ClientStatus::ClientSuccess);
        assert!(!state.is_loading());
        state.client_status = Some(ClientStatus::ClientLoading);
        assert!(state.is_loading());
        assert!(!state.is_empty());
    }
}
