use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bot::AppState;
use crate::config::DownloaderConfig;
use crate::messages::{render, Messages};
use crate::request::DownloadRequest;

/// How long to wait before retrying a failed document upload.
const RESEND_FILE_AFTER: Duration = Duration::from_secs(3);

/// Upload attempts per file before giving up and moving to the next one.
const MAX_FILE_SEND_RETRIES: u32 = 3;

/// Grace period for draining buffered downloader output after it exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variables the downloader reads its credentials from. Passing
/// them on the command line would expose them in the process list.
const LOGIN_ENV: &str = "LMS_LOGIN";
const PASSWORD_ENV: &str = "LMS_PASSWORD";

/// Running download jobs, keyed by job id. Jobs remove themselves on exit.
pub struct JobRegistry {
    jobs: Mutex<HashMap<u64, JobHandle>>,
    next_id: AtomicU64,
}

struct JobHandle {
    chat_id: ChatId,
    abort: watch::Sender<bool>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn register(&self, chat_id: ChatId, abort: watch::Sender<bool>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.jobs
            .lock()
            .await
            .insert(id, JobHandle { chat_id, abort });
        id
    }

    async fn remove(&self, id: u64) {
        self.jobs.lock().await.remove(&id);
    }

    /// Requests an abort. Only honored when `chat_id` owns the job, so one
    /// chat cannot cancel another chat's download.
    pub async fn abort(&self, id: u64, chat_id: ChatId) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(&id) {
            Some(handle) if handle.chat_id == chat_id => {
                handle.abort.send(true).is_ok()
            }
            _ => false,
        }
    }
}

/// Starts a download job for `chat_id` and returns its id. The job runs as a
/// detached task; progress and results are reported straight to the chat.
pub async fn spawn_job(
    bot: Bot,
    state: Arc<AppState>,
    chat_id: ChatId,
    request: DownloadRequest,
) -> u64 {
    let (abort_tx, abort_rx) = watch::channel(false);
    let job_id = state.jobs.register(chat_id, abort_tx).await;

    tokio::spawn(async move {
        if let Err(e) = run_job(&bot, &state, chat_id, job_id, request, abort_rx).await {
            error!("Download job {} failed: {:#}", job_id, e);
            let text = render(
                &state.messages.done_error,
                &[("log", ""), ("error", &e.to_string())],
            );
            if let Err(e) = bot.send_message(chat_id, text).await {
                warn!("Failed to report job {} failure to chat: {}", job_id, e);
            }
        }
        state.jobs.remove(job_id).await;
    });

    job_id
}

/// Full command line and environment for one downloader run. Kept as plain
/// data so the credential-handling rules are testable.
struct Invocation {
    program: String,
    args: Vec<String>,
    envs: Vec<(&'static str, String)>,
}

fn build_invocation(
    config: &DownloaderConfig,
    request: &DownloadRequest,
    out_dir: &Path,
) -> Invocation {
    let mut args = config.args.clone();
    args.push("--login-link".to_string());
    args.push(config.login_link.clone());
    args.push("--wait-between-pages".to_string());
    args.push(config.wait_between_pages_secs.to_string());
    if config.headless {
        args.push("--headless".to_string());
    }
    args.push("--output".to_string());
    args.push(out_dir.display().to_string());
    args.push(request.link.clone());

    Invocation {
        program: config.command.clone(),
        args,
        envs: vec![
            (LOGIN_ENV, request.login.clone()),
            (PASSWORD_ENV, request.password.clone()),
        ],
    }
}

enum Outcome {
    Finished(std::process::ExitStatus),
    Aborted,
    TimedOut,
}

async fn run_job(
    bot: &Bot,
    state: &AppState,
    chat_id: ChatId,
    job_id: u64,
    request: DownloadRequest,
    mut abort_rx: watch::Receiver<bool>,
) -> Result<()> {
    let config = &state.config.downloader;
    info!("Starting download job {} for chat {}", job_id, chat_id);

    let out_dir =
        tempfile::tempdir().context("Failed to create temporary output directory")?;
    let invocation = build_invocation(config, &request, out_dir.path());

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(invocation.envs.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start downloader: {}", invocation.program))?;

    let stdout = child
        .stdout
        .take()
        .context("Downloader stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("Downloader stderr was not captured")?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let mut log = LogBuffer::new(
        state.messages.log_line.clone(),
        state.config.telegram.max_log_chars,
    );
    let mut progress = ProgressReporter::new(bot.clone(), chat_id, job_id, &state.messages);

    let deadline = Instant::now() + config.process_timeout();
    let mut ticker = tokio::time::interval(state.config.telegram.send_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            line = stdout_lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => log.push(&line),
                _ => stdout_open = false,
            },
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => log.push(&line),
                _ => stderr_open = false,
            },
            status = child.wait() => {
                break Outcome::Finished(status.context("Failed to wait for downloader")?);
            }
            _ = ticker.tick() => {
                let remaining = deadline.saturating_duration_since(Instant::now()).as_secs();
                let text = render(&state.messages.progress, &[
                    ("log", log.as_str()),
                    ("remaining", &remaining.to_string()),
                ]);
                progress.update(text).await;
            }
            _ = abort_rx.changed() => break Outcome::Aborted,
            _ = tokio::time::sleep_until(deadline) => break Outcome::TimedOut,
        }
    };

    match outcome {
        Outcome::Finished(status) if status.success() => {
            drain_output(&mut stdout_lines, &mut stderr_lines, &mut log).await;
            info!("Job {} downloader finished, collecting files", job_id);
            progress
                .finish(render(&state.messages.done, &[("log", log.as_str())]))
                .await;
            send_files(bot, chat_id, out_dir.path()).await?;
            info!("Job {} finished", job_id);
        }
        Outcome::Finished(status) => {
            drain_output(&mut stdout_lines, &mut stderr_lines, &mut log).await;
            warn!("Job {} downloader exited with {}", job_id, status);
            progress
                .finish(render(&state.messages.done_error, &[
                    ("log", log.as_str()),
                    ("error", &status.to_string()),
                ]))
                .await;
        }
        Outcome::Aborted => {
            info!("Job {} aborted by user", job_id);
            kill_downloader(&mut child, job_id).await;
            progress
                .finish(render(&state.messages.done_aborted, &[("log", log.as_str())]))
                .await;
        }
        Outcome::TimedOut => {
            warn!(
                "Job {} exceeded {}s timeout",
                job_id, config.process_timeout_secs
            );
            kill_downloader(&mut child, job_id).await;
            progress
                .finish(render(&state.messages.done_aborted, &[("log", log.as_str())]))
                .await;
        }
    }

    Ok(())
}

async fn kill_downloader(child: &mut tokio::process::Child, job_id: u64) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill downloader for job {}: {}", job_id, e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap downloader for job {}: {}", job_id, e);
    }
}

/// Collects output still buffered in the pipes after the downloader exited.
async fn drain_output<R1, R2>(
    stdout_lines: &mut tokio::io::Lines<R1>,
    stderr_lines: &mut tokio::io::Lines<R2>,
    log: &mut LogBuffer,
) where
    R1: AsyncBufRead + Unpin,
    R2: AsyncBufRead + Unpin,
{
    let drain = async {
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            log.push(&line);
        }
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            log.push(&line);
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("Gave up draining downloader output");
    }
}

/// Sends every file from the output directory to the chat as a document,
/// retrying transient upload failures. A file that still fails after
/// [`MAX_FILE_SEND_RETRIES`] attempts is skipped so the rest get through.
async fn send_files(bot: &Bot, chat_id: ChatId, dir: &Path) -> Result<()> {
    let mut files = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read output directory: {}", dir.display()))?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    if files.is_empty() {
        warn!("Downloader produced no files in {}", dir.display());
        return Ok(());
    }

    for path in files {
        info!("Sending {}", path.display());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match bot.send_document(chat_id, InputFile::file(&path)).await {
                Ok(_) => break,
                Err(e) if attempt < MAX_FILE_SEND_RETRIES => {
                    warn!(
                        "Error sending {} (attempt {}): {}",
                        path.display(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(RESEND_FILE_AFTER).await;
                }
                Err(e) => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    );
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Relayed downloader output: numbered lines, trimmed from the front once the
/// buffer outgrows `max_chars` so the freshest lines always survive.
struct LogBuffer {
    text: String,
    next_line: usize,
    max_chars: usize,
    line_template: String,
}

impl LogBuffer {
    fn new(line_template: String, max_chars: usize) -> Self {
        Self {
            text: String::new(),
            next_line: 1,
            max_chars,
            line_template,
        }
    }

    fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.text.push_str(&render(
            &self.line_template,
            &[("line", &self.next_line.to_string()), ("text", line)],
        ));
        self.next_line += 1;

        if self.text.len() > self.max_chars {
            let mut cut = self.text.len() - self.max_chars;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text = self.text[cut..].to_string();
        }
    }

    fn as_str(&self) -> &str {
        &self.text
    }
}

/// One chat message that tracks a job: posted on the first tick, then edited
/// in place. Carries the abort button until the job reaches a final state.
struct ProgressReporter {
    bot: Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    keyboard: InlineKeyboardMarkup,
}

impl ProgressReporter {
    fn new(bot: Bot, chat_id: ChatId, job_id: u64, messages: &Messages) -> Self {
        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            messages.btn_abort.clone(),
            format!("abort:{}", job_id),
        )]]);
        Self {
            bot,
            chat_id,
            message_id: None,
            keyboard,
        }
    }

    async fn update(&mut self, text: String) {
        match self.message_id {
            None => match self
                .bot
                .send_message(self.chat_id, text)
                .reply_markup(self.keyboard.clone())
                .await
            {
                Ok(sent) => self.message_id = Some(sent.id),
                Err(e) => warn!("Failed to send progress message: {}", e),
            },
            Some(message_id) => {
                if let Err(e) = self
                    .bot
                    .edit_message_text(self.chat_id, message_id, text)
                    .reply_markup(self.keyboard.clone())
                    .await
                {
                    debug!("Failed to edit progress message: {}", e);
                }
            }
        }
    }

    /// Final edit; drops the abort button.
    async fn finish(&mut self, text: String) {
        let result = match self.message_id {
            Some(message_id) => self
                .bot
                .edit_message_text(self.chat_id, message_id, text)
                .await
                .map(|_| ()),
            None => self.bot.send_message(self.chat_id, text).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!("Failed to send final job message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloaderConfig;

    fn test_config() -> DownloaderConfig {
        DownloaderConfig {
            command: "lmsdownloader".to_string(),
            args: vec!["--quiet".to_string()],
            login_link: "https://lms.example.com/login".to_string(),
            link_check_regex: ".*".to_string(),
            wait_between_pages_secs: 1.5,
            headless: true,
            process_timeout_secs: 600,
        }
    }

    fn test_request() -> DownloadRequest {
        DownloadRequest {
            login: "user".to_string(),
            password: "hunter2".to_string(),
            link: "https://lms.example.com/p/1".to_string(),
        }
    }

    #[test]
    fn invocation_keeps_credentials_off_argv() {
        let invocation =
            build_invocation(&test_config(), &test_request(), Path::new("/tmp/out"));
        assert!(invocation.args.iter().all(|a| a != "user" && a != "hunter2"));
        assert!(invocation
            .envs
            .contains(&(LOGIN_ENV, "user".to_string())));
        assert!(invocation
            .envs
            .contains(&(PASSWORD_ENV, "hunter2".to_string())));
    }

    #[test]
    fn invocation_arguments() {
        let invocation =
            build_invocation(&test_config(), &test_request(), Path::new("/tmp/out"));
        assert_eq!(invocation.program, "lmsdownloader");
        assert_eq!(invocation.args[0], "--quiet");
        assert!(invocation.args.contains(&"--headless".to_string()));
        assert!(invocation.args.contains(&"--login-link".to_string()));
        assert!(invocation.args.contains(&"/tmp/out".to_string()));
        assert_eq!(
            invocation.args.last().map(String::as_str),
            Some("https://lms.example.com/p/1")
        );
    }

    #[test]
    fn invocation_headful_drops_flag() {
        let mut config = test_config();
        config.headless = false;
        let invocation = build_invocation(&config, &test_request(), Path::new("/tmp/out"));
        assert!(!invocation.args.contains(&"--headless".to_string()));
    }

    #[test]
    fn log_buffer_numbers_lines_and_skips_blanks() {
        let mut log = LogBuffer::new("{line}. {text}\n".to_string(), 1024);
        log.push("logging in");
        log.push("   ");
        log.push("saving page");
        assert_eq!(log.as_str(), "1. logging in\n2. saving page\n");
    }

    #[test]
    fn log_buffer_keeps_tail_when_full() {
        let mut log = LogBuffer::new("{line}. {text}\n".to_string(), 20);
        for _ in 0..10 {
            log.push("step");
        }
        assert!(log.as_str().len() <= 20);
        assert!(log.as_str().contains("10. step"));
        assert!(!log.as_str().contains("1. step\n2."));
    }

    #[test]
    fn log_buffer_cuts_at_char_boundary() {
        let mut log = LogBuffer::new("{text}".to_string(), 4);
        log.push("ééé");
        assert!(log.as_str().len() <= 4);
        assert!(log.as_str().chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn registry_abort_requires_owning_chat() {
        let registry = JobRegistry::new();
        let (abort_tx, abort_rx) = watch::channel(false);
        let id = registry.register(ChatId(1), abort_tx).await;

        assert!(!registry.abort(id, ChatId(2)).await);
        assert!(!*abort_rx.borrow());

        assert!(registry.abort(id, ChatId(1)).await);
        assert!(*abort_rx.borrow());
    }

    #[tokio::test]
    async fn registry_abort_unknown_job_is_noop() {
        let registry = JobRegistry::new();
        assert!(!registry.abort(42, ChatId(1)).await);
    }

    #[tokio::test]
    async fn registry_remove_forgets_job() {
        let registry = JobRegistry::new();
        let (abort_tx, _abort_rx) = watch::channel(false);
        let id = registry.register(ChatId(1), abort_tx).await;
        registry.remove(id).await;
        assert!(!registry.abort(id, ChatId(1)).await);
    }
}
