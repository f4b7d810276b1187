use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::feed::discord::DEFAULT_API_BASE;
use crate::template::{self, DEFAULT_TEMPLATE};
use crate::transfer::{SftpAuth, SftpSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often to check the channel (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Where the last processed message id is kept
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Destination file name template, e.g. "{timestamp}_{message_id}_{filename}"
    #[serde(default = "default_rename_template")]
    pub rename_template: String,

    pub discord: DiscordConfig,

    pub sftp: SftpConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token (without the "Bot " prefix)
    pub token: String,

    /// Channel to watch
    pub channel_id: String,

    /// REST API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,

    #[serde(default = "default_sftp_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Private key file (OpenSSH or PEM)
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default)]
    pub key_passphrase: Option<String>,

    /// Directory uploads land in; created if missing
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Upper bound for one whole transfer, connect included (seconds)
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

// Hand-written so secrets never end up in logs.
impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("token", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth", &self.auth())
            .field("remote_dir", &self.remote_dir)
            .field("transfer_timeout_secs", &self.transfer_timeout_secs)
            .finish()
    }
}

fn default_poll_interval() -> u64 {
    60 // 1 minute
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./state.json")
}

fn default_rename_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_sftp_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    ".".to_string()
}

fn default_transfer_timeout() -> u64 {
    60
}

/// Non-empty environment variable.
fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    env_opt(name).ok_or(ConfigError::Missing(name))
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

impl SftpConfig {
    pub fn auth(&self) -> SftpAuth {
        SftpAuth {
            password: self.password.clone(),
            key_path: self.key_path.clone(),
            key_passphrase: self.key_passphrase.clone(),
        }
    }

    pub fn settings(&self) -> SftpSettings {
        SftpSettings {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            auth: self.auth(),
            inactivity_timeout: self.transfer_timeout(),
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let config: Config = toml::from_str(&content).map_err(|e| file_err(e.to_string()))?;
        Ok(config)
    }

    /// Build from the environment, using the same variable names as the old bot.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", default_poll_interval())?,
            state_path: env_opt("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_path),
            rename_template: env_opt("RENAME_PATTERN").unwrap_or_else(default_rename_template),
            discord: DiscordConfig {
                token: env_required("DISCORD_TOKEN")?,
                channel_id: env_required("CHANNEL_ID")?,
                api_base: env_opt("DISCORD_API_BASE").unwrap_or_else(default_api_base),
            },
            sftp: SftpConfig {
                host: env_required("SFTP_HOST")?,
                port: env_parse("SFTP_PORT", default_sftp_port())?,
                user: env_required("SFTP_USER")?,
                password: env_opt("SFTP_PASSWORD"),
                key_path: env_opt("SFTP_KEY_PATH").map(PathBuf::from),
                key_passphrase: env_opt("SFTP_KEY_PASSPHRASE"),
                remote_dir: env_opt("SFTP_REMOTE_DIR").unwrap_or_else(default_remote_dir),
                transfer_timeout_secs: env_parse(
                    "TRANSFER_TIMEOUT_SECS",
                    default_transfer_timeout(),
                )?,
            },
        })
    }

    /// Reject configurations that could never complete a tick.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.token.trim().is_empty() {
            return Err(ConfigError::Missing("discord.token"));
        }
        if self.discord.channel_id.trim().is_empty() {
            return Err(ConfigError::Missing("discord.channel_id"));
        }
        if !self.discord.channel_id.trim().chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                name: "discord.channel_id",
                reason: format!("'{}' is not a snowflake", self.discord.channel_id),
            });
        }
        if self.sftp.host.trim().is_empty() {
            return Err(ConfigError::Missing("sftp.host"));
        }
        if self.sftp.user.trim().is_empty() {
            return Err(ConfigError::Missing("sftp.user"));
        }
        if self.sftp.password.is_none() && self.sftp.key_path.is_none() {
            return Err(ConfigError::NoCredentials);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "poll_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sftp.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "sftp.transfer_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        template::validate(&self.rename_template)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn example() -> Self {
        Config {
            poll_interval_secs: 60,
            state_path: PathBuf::from("./state.json"),
            rename_template: DEFAULT_TEMPLATE.to_string(),
            discord: DiscordConfig {
                token: "your-bot-token".to_string(),
                channel_id: "123456789012345678".to_string(),
                api_base: DEFAULT_API_BASE.to_string(),
            },
            sftp: SftpConfig {
                host: "sftp.example.com".to_string(),
                port: 22,
                user: "relay".to_string(),
                password: Some("your-password".to_string()),
                key_path: None,
                key_passphrase: None,
                remote_dir: "uploads".to_string(),
                transfer_timeout_secs: 60,
            },
        }
    }
}
