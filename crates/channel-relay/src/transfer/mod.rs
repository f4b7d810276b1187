//! Remote storage transfer.
//!
//! [`TransferClient`] owns the per-transfer connection lifecycle: connect,
//! make sure the target directory exists, upload, and always close the
//! session again, whether the upload worked or not. Nothing is retried here;
//! a failed transfer is simply attempted again on the next poll.

pub mod sftp;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};

use crate::error::TransferError;

pub use sftp::{SftpAuth, SftpSettings, SftpStore};

/// Something we can open a session against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    type Session: RemoteSession;

    /// Host name used in logs and errors.
    fn host(&self) -> &str;

    async fn connect(&self) -> Result<Self::Session, TransferError>;
}

/// An open connection to the remote store.
#[async_trait]
pub trait RemoteSession: Send {
    /// Create `path` (and its parents) unless it already exists.
    async fn ensure_dir(&mut self, path: &str) -> Result<(), TransferError>;

    /// Write `bytes` to `dir/name`, replacing any existing file.
    async fn upload(&mut self, dir: &str, name: &str, bytes: &[u8]) -> Result<(), TransferError>;

    async fn close(self) -> Result<(), TransferError>;
}

/// Join a remote directory and file name with a single `/`.
pub fn remote_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Uploads one payload per call over a fresh session.
pub struct TransferClient<R> {
    store: R,
    remote_dir: String,
    timeout: Duration,
}

impl<R: RemoteStore> TransferClient<R> {
    pub fn new(store: R, remote_dir: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            remote_dir: remote_dir.into(),
            timeout,
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    /// Upload `bytes` as `name` inside the configured remote directory.
    pub async fn send(&self, name: &str, bytes: &[u8]) -> Result<(), TransferError> {
        let path = remote_path(&self.remote_dir, name);

        tracing::info!(
            "Transfer: uploading {} bytes to {}:{}",
            bytes.len(),
            self.store.host(),
            path
        );

        self.transfer(name, bytes).await?;
        tracing::info!("Transfer: upload complete ({})", path);
        Ok(())
    }

    fn timed_out(&self) -> TransferError {
        TransferError::Timeout {
            host: self.store.host().to_string(),
            timeout: self.timeout,
        }
    }

    /// Connect and upload share one deadline. The session is closed on every
    /// path once it exists, including when the deadline expires mid-upload.
    async fn transfer(&self, name: &str, bytes: &[u8]) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.timeout;

        let mut session = time::timeout_at(deadline, self.store.connect())
            .await
            .map_err(|_| self.timed_out())??;

        let work = async {
            session.ensure_dir(&self.remote_dir).await?;
            session.upload(&self.remote_dir, name, bytes).await
        };
        let result = time::timeout_at(deadline, work)
            .await
            .unwrap_or_else(|_| Err(self.timed_out()));

        // An upload error wins over a close error.
        let closed = match time::timeout(self.timeout, session.close()).await {
            Ok(closed) => closed,
            Err(_) => Err(self.timed_out()),
        };
        match (result, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::warn!("Transfer: failed to close session: {}", close_err);
                }
                Err(e)
            }
            (Ok(()), Err(close_err)) => {
                // The bytes are already written; the server just hung up rudely.
                tracing::warn!("Transfer: failed to close session: {}", close_err);
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
