use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const USER_CHANNEL_PREFIX: &str = "private-user.";
pub const THREAD_CHANNEL_PREFIX: &str = "private-thread.";

// Backends hand out ids as either JSON numbers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
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
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(match RawId::deserialize(deserializer)? {
                    RawId::Text(value) => Self(value),
                    RawId::Number(value) => Self(value.to_string()),
                })
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ThreadId);
id_newtype!(MessageId);

/// What a private channel name refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    User(UserId),
    Thread(ThreadId),
}

impl ChannelTarget {
    pub fn channel_name(&self) -> String {
        match self {
            Self::User(user_id) => user_channel(user_id),
            Self::Thread(thread_id) => thread_channel(thread_id),
        }
    }
}

pub fn user_channel(user_id: &UserId) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

pub fn thread_channel(thread_id: &ThreadId) -> String {
    format!("{THREAD_CHANNEL_PREFIX}{thread_id}")
}
