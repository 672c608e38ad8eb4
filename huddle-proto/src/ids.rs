//! Identifier newtypes shared by server and client

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Conferencing room identifier, chosen by the joining client
    RoomId
);

string_id!(
    /// Peer identifier. Equal to the signaling connection id.
    PeerId
);

string_id!(
    /// Send or receive transport identifier, assigned by the media engine
    TransportId
);

string_id!(
    /// Producer identifier, assigned by the media engine
    ProducerId
);

string_id!(
    /// Consumer identifier, assigned by the media engine
    ConsumerId
);
