//! Branded ID newtypes for type safety.
//!
//! Conversation identities arrive from upstream (already authenticated) and
//! are kept verbatim. Message and feedback IDs minted by the relay are UUID v7
//! (time-ordered) generated via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identity of a conversation (chat or room). Doubles as the session key.
    ConversationId
}

branded_id! {
    /// Unique identifier for a stored message.
    MessageId
}

branded_id! {
    /// Unique identifier for a feedback slot (conversation-level or per message).
    FeedbackId
}

branded_id! {
    /// Unique identifier for one accepted transport connection.
    ConnectionId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn v7_ids_sort_by_creation() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert!(a < b);
    }

    #[test]
    fn conversation_id_kept_verbatim() {
        let id = ConversationId::from("65f1c0ffee0000000000abcd");
        assert_eq!(id.as_str(), "65f1c0ffee0000000000abcd");
        assert_eq!(id.to_string(), "65f1c0ffee0000000000abcd");
    }

    #[test]
    fn serde_is_transparent() {
        let id = FeedbackId::from("fb-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"fb-1\"");
        let back: FeedbackId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn deref_to_str() {
        let id = ConnectionId::from("c1");
        assert!(id.starts_with('c'));
        assert_eq!(String::from(id), "c1");
    }
}
