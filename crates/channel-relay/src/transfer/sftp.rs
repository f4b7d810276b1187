//! SFTP implementation of [`RemoteStore`] on top of russh.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use super::{remote_path, RemoteSession, RemoteStore};
use crate::error::TransferError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials for the SFTP login. A key, when present, is tried before the password.
#[derive(Clone, Default)]
pub struct SftpAuth {
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
}

impl fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpAuth")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SftpAuth,
    /// Idle SSH connections are dropped after this long.
    pub inactivity_timeout: Duration,
}

/// Opens one SSH connection plus SFTP subsystem per [`RemoteStore::connect`].
pub struct SftpStore {
    settings: SftpSettings,
}

impl SftpStore {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }

    fn connect_err(&self, reason: impl Into<String>) -> TransferError {
        TransferError::Connect {
            host: self.settings.host.clone(),
            port: self.settings.port,
            reason: reason.into(),
        }
    }

    fn auth_err(&self, reason: impl Into<String>) -> TransferError {
        TransferError::Auth {
            host: self.settings.host.clone(),
            user: self.settings.user.clone(),
            reason: reason.into(),
        }
    }

    async fn authenticate(&self, ssh: &mut Handle<HostKeyLogger>) -> Result<(), TransferError> {
        let user = &self.settings.user;
        let auth = &self.settings.auth;

        if let Some(key_path) = &auth.key_path {
            let key = load_secret_key(key_path, auth.key_passphrase.as_deref()).map_err(|e| {
                self.auth_err(format!("failed to load key {}: {}", key_path.display(), e))
            })?;
            let hash_alg = ssh
                .best_supported_rsa_hash()
                .await
                .map_err(|e| self.auth_err(e.to_string()))?
                .flatten();

            let result = ssh
                .authenticate_publickey(
                    user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| self.auth_err(e.to_string()))?;

            if result.success() {
                return Ok(());
            }
            tracing::warn!(
                "SFTP: key {} rejected for {}@{}",
                key_path.display(),
                user,
                self.settings.host
            );
        }

        if let Some(password) = &auth.password {
            let result = ssh
                .authenticate_password(user.clone(), password.clone())
                .await
                .map_err(|e| self.auth_err(e.to_string()))?;

            if result.success() {
                return Ok(());
            }
        }

        Err(self.auth_err("server rejected all configured credentials"))
    }
}

/// Accepts any host key, logging its fingerprint.
pub struct HostKeyLogger {
    host: String,
}

impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "SFTP: accepting host key for {} ({})",
            self.host,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

#[async_trait]
impl RemoteStore for SftpStore {
    type Session = SftpConnection;

    fn host(&self) -> &str {
        &self.settings.host
    }

    async fn connect(&self) -> Result<SftpConnection, TransferError> {
        let settings = &self.settings;
        tracing::info!(
            "SFTP: connecting to {}:{} as {}",
            settings.host,
            settings.port,
            settings.user
        );

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(settings.inactivity_timeout),
            ..Default::default()
        });
        let handler = HostKeyLogger {
            host: settings.host.clone(),
        };

        let connecting = client::connect(config, (settings.host.as_str(), settings.port), handler);
        let mut ssh = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| self.connect_err(format!("timed out after {:?}", CONNECT_TIMEOUT)))?
            .map_err(|e| self.connect_err(e.to_string()))?;

        self.authenticate(&mut ssh).await?;

        let channel = ssh
            .channel_open_session()
            .await
            .map_err(|e| self.connect_err(format!("failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.connect_err(format!("sftp subsystem refused: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.connect_err(format!("sftp handshake failed: {}", e)))?;

        Ok(SftpConnection {
            host: settings.host.clone(),
            ssh,
            sftp,
        })
    }
}

pub struct SftpConnection {
    host: String,
    ssh: Handle<HostKeyLogger>,
    sftp: SftpSession,
}

impl SftpConnection {
    fn io_err(&self, path: &str, reason: impl fmt::Display) -> TransferError {
        TransferError::Io {
            host: self.host.clone(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Every directory that must exist for `path`, shallowest first.
fn dir_chain(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut chain = Vec::new();
    let mut current = String::new();

    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        chain.push(current.clone());
    }

    chain
}

#[async_trait]
impl RemoteSession for SftpConnection {
    async fn ensure_dir(&mut self, path: &str) -> Result<(), TransferError> {
        for dir in dir_chain(path) {
            let exists = self
                .sftp
                .try_exists(dir.clone())
                .await
                .map_err(|e| self.io_err(&dir, e))?;

            if !exists {
                self.sftp
                    .create_dir(dir.clone())
                    .await
                    .map_err(|e| self.io_err(&dir, e))?;
                tracing::info!("SFTP: created directory {}", dir);
            }
        }
        Ok(())
    }

    async fn upload(&mut self, dir: &str, name: &str, bytes: &[u8]) -> Result<(), TransferError> {
        let path = remote_path(dir, name);

        let mut file = self
            .sftp
            .create(path.clone())
            .await
            .map_err(|e| self.io_err(&path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| self.io_err(&path, e))?;
        file.shutdown().await.map_err(|e| self.io_err(&path, e))?;

        Ok(())
    }

    async fn close(self) -> Result<(), TransferError> {
        let sftp_closed = self.sftp.close().await;
        let ssh_closed = self
            .ssh
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        sftp_closed.map_err(|e| TransferError::Io {
            host: self.host.clone(),
            path: String::new(),
            reason: format!("sftp close failed: {}", e),
        })?;
        ssh_closed.map_err(|e| TransferError::Io {
            host: self.host.clone(),
            path: String::new(),
            reason: format!("disconnect failed: {}", e),
        })?;

        tracing::debug!("SFTP: disconnected from {}", self.host);
        Ok(())
    }
}
