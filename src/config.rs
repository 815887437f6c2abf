use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub downloader: DownloaderConfig,
    #[serde(default = "default_messages_file")]
    pub messages_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_api_token: String,
    /// How often the progress message in chat is edited with fresh log lines.
    #[serde(default = "default_send_interval")]
    pub send_messages_interval_secs: u64,
    /// Cap on the log excerpt relayed to chat (Telegram messages max out at
    /// 4096 chars; the template around the excerpt needs room too).
    #[serde(default = "default_max_log_chars")]
    pub max_log_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloaderConfig {
    /// Executable that performs the actual headless-browser download.
    pub command: String,
    /// Extra arguments placed before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// LMS login page the downloader authenticates against.
    pub login_link: String,
    /// Pattern a requested URL must match before a job is started.
    pub link_check_regex: String,
    #[serde(default = "default_wait_between_pages")]
    pub wait_between_pages_secs: f64,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Wall-clock budget for one download job, including file uploads.
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,
}

fn default_messages_file() -> PathBuf {
    PathBuf::from("messages.json")
}

fn default_send_interval() -> u64 {
    3
}

fn default_max_log_chars() -> usize {
    2048
}

fn default_wait_between_pages() -> f64 {
    1.0
}

fn default_headless() -> bool {
    true
}

fn default_process_timeout() -> u64 {
    600
}

impl TelegramConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_messages_interval_secs.max(1))
    }
}

impl DownloaderConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if config.telegram.bot_api_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_api_token must not be empty");
        }
        if config.downloader.command.trim().is_empty() {
            anyhow::bail!("downloader.command must not be empty");
        }

        Ok(config)
    }
}
