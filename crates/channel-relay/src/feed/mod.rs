//! Message feed abstraction.
//!
//! The poll loop only ever asks for the single latest message of a channel
//! and, when that message carries an image, for the bytes of one attachment.

pub mod discord;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FetchError;

pub use discord::DiscordClient;

/// Discord snowflake. Larger ids are newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(MessageId)
    }
}

// Snowflakes travel as strings so JSON consumers never lose precision.
impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(MessageId(n)),
        }
    }
}

/// Attachment metadata as delivered with a message. Bytes are fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub url: String,
}

/// One message from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    pub channel_id: String,
    pub attachments: Vec<Attachment>,
}

/// Source of messages for the relay.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Latest message in the channel, or `None` when the channel is empty.
    async fn fetch_latest(&self, channel_id: &str) -> Result<Option<Item>, FetchError>;

    /// Download the payload of an attachment.
    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, FetchError>;
}
