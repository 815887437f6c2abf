use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::downloader::{self, JobRegistry};
use crate::messages::{render, Messages};
use crate::request::DownloadRequest;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Document uploads can take a while; the stock teloxide client timeout is
/// too tight for lecture-sized files.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub messages: Messages,
    pub link_regex: Regex,
    pub jobs: JobRegistry,
}

impl AppState {
    pub fn new(config: Config, messages: Messages) -> Result<Self> {
        let link_regex = Regex::new(&config.downloader.link_check_regex).with_context(|| {
            format!(
                "Invalid link_check_regex: {}",
                config.downloader.link_check_regex
            )
        })?;
        Ok(Self {
            config,
            messages,
            link_regex,
            jobs: JobRegistry::new(),
        })
    }
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
}

/// Start the Telegram bot (blocking until shutdown)
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let bot = Bot::with_client(state.config.telegram.bot_api_token.clone(), client);

    info!("Starting Telegram bot...");

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(
            // Unrecognized commands get the usage text instead of being
            // parsed as credentials.
            Update::filter_message()
                .filter(|msg: Message| {
                    msg.text().map(|t| t.starts_with('/')).unwrap_or(false)
                })
                .endpoint(handle_unknown_command),
        )
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("bot"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn send_start(bot: &Bot, chat_id: ChatId, state: &AppState) -> ResponseResult<()> {
    let text = render(&state.messages.start, &[("version", VERSION)]);
    bot.send_message(chat_id, text).await?;
    Ok(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    _cmd: Command,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    info!("/start command from chat {}", msg.chat.id);
    send_start(&bot, msg.chat.id, &state).await
}

async fn handle_unknown_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    info!("Unknown command from chat {}", msg.chat.id);
    send_start(&bot, msg.chat.id, &state).await
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    // Never log the message body here; two thirds of it are credentials.
    info!("Download request from chat {}", chat_id);

    let request = match DownloadRequest::parse(&text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed request from chat {}: {}", chat_id, e);
            bot.send_message(chat_id, state.messages.usage_error.clone())
                .await?;
            return Ok(());
        }
    };

    if !state.link_regex.is_match(&request.link) {
        warn!("Rejected link from chat {}: wrong format", chat_id);
        let text = render(
            &state.messages.wrong_link,
            &[("regex", state.link_regex.as_str())],
        );
        bot.send_message(chat_id, text).await?;
        return Ok(());
    }

    let job_id = downloader::spawn_job(bot, state, chat_id, request).await;
    info!("Started download job {} for chat {}", job_id, chat_id);
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    // Abort is only honored from the chat the progress message lives in.
    let Some(chat_id) = q.regular_message().map(|m| m.chat.id) else {
        return Ok(());
    };

    match parse_abort_payload(data) {
        Some(job_id) => {
            if state.jobs.abort(job_id, chat_id).await {
                info!("Abort requested for job {} by chat {}", job_id, chat_id);
            } else {
                debug!("Ignoring abort for unknown job {} from chat {}", job_id, chat_id);
            }
        }
        None => debug!("Ignoring unknown callback payload: {}", data),
    }
    Ok(())
}

fn parse_abort_payload(data: &str) -> Option<u64> {
    data.strip_prefix("abort:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_payload_parses_job_id() {
        assert_eq!(parse_abort_payload("abort:42"), Some(42));
    }

    #[test]
    fn abort_payload_rejects_garbage() {
        assert_eq!(parse_abort_payload("abort:"), None);
        assert_eq!(parse_abort_payload("abort:x"), None);
        assert_eq!(parse_abort_payload("connect:1"), None);
        assert_eq!(parse_abort_payload(""), None);
    }

    #[test]
    fn state_rejects_invalid_link_regex() {
        let config: Config = serde_json::from_str(
            r#"{
                "telegram": { "bot_api_token": "t" },
                "downloader": {
                    "command": "lmsdownloader",
                    "login_link": "https://lms.example.com/login",
                    "link_check_regex": "["
                }
            }"#,
        )
        .unwrap();
        let messages: Messages = serde_json::from_str(
            r#"{
                "start": "v{version}",
                "usage_error": "usage",
                "wrong_link": "{regex}",
                "progress": "{log} {remaining}",
                "done": "{log}",
                "done_error": "{log} {error}",
                "done_aborted": "{log}",
                "log_line": "{line}. {text}\n",
                "btn_abort": "Abort"
            }"#,
        )
        .unwrap();
        assert!(AppState::new(config, messages).is_err());
    }
}
