use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use channel_relay::config::Config;
use channel_relay::cursor::{CursorStore, FileCursorStore};
use channel_relay::feed::DiscordClient;
use channel_relay::poller::{PollingScheduler, Relay};
use channel_relay::template::{self, NameResolver, RenderContext};
use channel_relay::transfer::{SftpStore, TransferClient};

#[derive(Parser)]
#[command(name = "channel-relay")]
#[command(about = "Relay images posted to a Discord channel to an SFTP server")]
struct Cli {
    /// Path to a TOML configuration file (environment variables are used otherwise)
    #[arg(short, long, env = "CHANNEL_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single check and exit
    #[arg(long)]
    once: bool,

    /// Log filter, e.g. "channel_relay=debug" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Expand a rename template against a sample message and print the result
    CheckTemplate {
        template: String,
    },
    /// Print an example configuration file
    ExampleConfig,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "channel_relay=info".into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("Failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckTemplate { template }) => {
            let name = template::resolve(template, &RenderContext::sample())?;
            println!("{}", name);
            return Ok(());
        }
        Some(Command::ExampleConfig) => {
            print!("{}", toml::to_string_pretty(&Config::example())?);
            return Ok(());
        }
        None => {}
    }

    init_tracing(cli.log_level.as_deref());

    tracing::info!("Starting channel relay");

    let config = load_config(cli.config.as_ref())?;
    tracing::info!(
        "Watching channel {} -> {}@{}:{}:{} (template: {})",
        config.discord.channel_id,
        config.sftp.user,
        config.sftp.host,
        config.sftp.port,
        config.sftp.remote_dir,
        config.rename_template
    );

    // A state file we cannot read is fatal; guessing would re-send or drop images.
    let cursor_store = FileCursorStore::new(&config.state_path);
    let cursor = cursor_store
        .load()
        .with_context(|| format!("Failed to load state from {}", config.state_path.display()))?;
    tracing::info!("Loaded state (last_message_id={})", cursor);

    let feed = DiscordClient::new(config.discord.token.clone(), config.discord.api_base.clone())?;
    let transfer = TransferClient::new(
        SftpStore::new(config.sftp.settings()),
        config.sftp.remote_dir.clone(),
        config.sftp.transfer_timeout(),
    );
    let resolver = NameResolver::new(config.rename_template.clone())?;

    let relay = Relay::new(
        feed,
        config.discord.channel_id.trim(),
        resolver,
        transfer,
        cursor_store,
    );
    let scheduler = PollingScheduler::new(relay, config.poll_interval());

    if cli.once {
        let (cursor, outcome) = scheduler.run_once(cursor).await?;
        tracing::info!("Check complete: {:?} (last_message_id={})", outcome, cursor);
        return Ok(());
    }

    tracing::info!("Channel relay running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = scheduler.run(cursor) => {}
        res = shutdown_signal() => {
            res?;
            tracing::info!("Shutdown signal received, stopping...");
        }
    }

    tracing::info!("Channel relay stopped");
    Ok(())
}
