mod bot;
mod config;
mod downloader;
mod messages;
mod request;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::messages::Messages;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lms_downloader_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("LMSDownloader telegram bot v{}", bot::VERSION);

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LMS_DOWNLOADER_BOT_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let messages = Messages::load(&config.messages_file).with_context(|| {
        format!(
            "Failed to load messages from {}",
            config.messages_file.display()
        )
    })?;

    info!("Configuration loaded successfully");
    info!("  Downloader: {}", config.downloader.command);
    info!("  Link pattern: {}", config.downloader.link_check_regex);
    info!("  Process timeout: {}s", config.downloader.process_timeout_secs);

    // Create shared state
    let state = Arc::new(AppState::new(config, messages)?);

    // Run the Telegram bot
    info!("Bot is starting...");
    bot::run(state).await?;

    info!("Bot stopped");
    Ok(())
}
