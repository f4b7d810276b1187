//! Discord REST client for reading the latest channel message.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;

use super::{Attachment, FeedSource, Item, MessageId};
use crate::error::FetchError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/channel-relay/channel-relay, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Client for the Discord REST API using a bot token
pub struct DiscordClient {
    http: Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: MessageId,
    channel_id: String,
    timestamp: DateTime<Utc>,
    author: WireAuthor,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireAuthor {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    id: String,
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
    url: String,
}

impl From<WireMessage> for Item {
    fn from(msg: WireMessage) -> Self {
        Item {
            id: msg.id,
            created_at: msg.timestamp,
            author_id: msg.author.id,
            channel_id: msg.channel_id,
            attachments: msg
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id,
                    filename: a.filename,
                    content_type: a.content_type,
                    size: a.size,
                    url: a.url,
                })
                .collect(),
        }
    }
}

impl DiscordClient {
    pub fn new(token: impl Into<String>, api_base: impl Into<String>) -> Result<Self, FetchError> {
        let api_base = api_base.into();
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| FetchError::Request {
                url: api_base.clone(),
                source,
            })?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{}/messages?limit=1", self.api_base, channel_id)
    }
}

/// Decode a `GET /channels/{id}/messages` body into the newest item.
fn parse_latest(url: &str, body: &str) -> Result<Option<Item>, FetchError> {
    let messages: Vec<WireMessage> =
        serde_json::from_str(body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    // Discord returns newest first; take the max anyway in case limit is ignored.
    Ok(messages.into_iter().max_by_key(|m| m.id).map(Item::from))
}

#[async_trait]
impl FeedSource for DiscordClient {
    async fn fetch_latest(&self, channel_id: &str) -> Result<Option<Item>, FetchError> {
        let url = self.messages_url(channel_id);
        tracing::debug!("Fetching latest message from channel {}", channel_id);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized {
                channel_id: channel_id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|source| FetchError::Request {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        parse_latest(&url, &body)
    }

    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, FetchError> {
        let download_err = |reason: String| FetchError::Download {
            filename: attachment.filename.clone(),
            reason,
        };

        let response = self
            .http
            .get(&attachment.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_err(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        tracing::debug!(
            "Downloaded {} bytes for attachment {}",
            bytes.len(),
            attachment.filename
        );

        Ok(bytes.to_vec())
    }
}
