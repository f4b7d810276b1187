//! Error taxonomy for the relay.
//!
//! Each stage of a tick fails with its own error type so the poll loop (and
//! the binary) can tell a flaky feed apart from a broken SFTP server or a
//! misconfigured template.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The feed could not be reached, refused our token, or returned garbage.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure talking to the feed API.
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The token was rejected or lacks access to the channel.
    #[error("Unauthorized for channel {channel_id} (HTTP {status})")]
    Unauthorized { channel_id: String, status: u16 },

    /// Any other non-success status.
    #[error("Unexpected HTTP {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// Downloading the attachment bytes failed.
    #[error("Failed to download attachment {filename}: {reason}")]
    Download { filename: String, reason: String },
}

/// The remote storage endpoint could not be reached or written.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {user}@{host}: {reason}")]
    Auth {
        host: String,
        user: String,
        reason: String,
    },

    #[error("SFTP operation on {host} failed for {path}: {reason}")]
    Io {
        host: String,
        path: String,
        reason: String,
    },

    #[error("Transfer to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

impl TransferError {
    pub fn host(&self) -> &str {
        match self {
            TransferError::Connect { host, .. }
            | TransferError::Auth { host, .. }
            | TransferError::Io { host, .. }
            | TransferError::Timeout { host, .. } => host,
        }
    }
}

/// The rename template is invalid. Always a configuration defect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown placeholder {{{name}}} in template")]
    UnknownPlaceholder { name: String },

    #[error("Unclosed '{{' at position {position} in template")]
    Unclosed { position: usize },

    #[error("Unmatched '}}' at position {position} in template")]
    UnmatchedClose { position: usize },

    #[error("Template expanded to an empty file name")]
    EmptyName,
}

/// The cursor state file could not be read or written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on state file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file '{path}': {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Provide an SFTP password or a private key path")]
    NoCredentials,

    #[error("Failed to read config file '{path}': {reason}")]
    File { path: PathBuf, reason: String },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Anything that can abort a tick.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl RelayError {
    /// Short label used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Fetch(_) => "fetch",
            RelayError::Transfer(_) => "transfer",
            RelayError::Template(_) => "template",
            RelayError::State(_) => "state",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
