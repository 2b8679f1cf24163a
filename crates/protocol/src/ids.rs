use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id! {
    /// Client-generated identity, stable across a client's reconnects.
    /// The derived `Ord` is lexicographic on the underlying string; the
    /// negotiation layer relies on it for polite-role assignment.
    UserId
}

opaque_id! {
    /// Server-assigned per-transport-session identity. A client gets a fresh
    /// one on every reconnect.
    SocketId
}

opaque_id! {
    /// Opaque room name.
    RoomId
}

opaque_id! {
    /// Client-generated chat message identity.
    MessageId
}

impl UserId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl SocketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_strings() {
        let user = UserId::from("u1");
        assert_eq!(serde_json::to_string(&user).unwrap(), r#""u1""#);
        let parsed: UserId = serde_json::from_str(r#""u1""#).unwrap();
        assert_eq!(parsed, user);
    }

    #[test]
    fn user_id_order_is_lexicographic() {
        assert!(UserId::from("u1") < UserId::from("u2"));
        assert!(UserId::from("a") < UserId::from("ab"));
        assert!(UserId::from("Z") < UserId::from("a"));
    }

    #[test]
    fn generated_socket_ids_are_unique() {
        let a = SocketId::generate();
        let b = SocketId::generate();
        assert_ne!(a, b);
    }
}
