use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// User-facing message templates, loaded from a JSON file so deployments can
/// localize the bot without rebuilding it.
///
/// Templates use `{name}` placeholders filled by [`render`]. Each field's doc
/// comment lists the placeholders it may reference.
#[derive(Debug, Deserialize, Clone)]
pub struct Messages {
    /// Reply to /start and unknown commands. Placeholders: `{version}`.
    pub start: String,
    /// Reply to a message that is not three non-empty lines. Placeholders: none.
    pub usage_error: String,
    /// Reply when the URL fails the link check. Placeholders: `{regex}`.
    pub wrong_link: String,
    /// Progress message body, edited in place while the downloader runs.
    /// Placeholders: `{log}`, `{remaining}` (seconds until timeout).
    pub progress: String,
    /// Final edit after a successful run. Placeholders: `{log}`.
    pub done: String,
    /// Final edit after a failed run. Placeholders: `{log}`, `{error}`.
    pub done_error: String,
    /// Final edit after an abort or timeout. Placeholders: `{log}`.
    pub done_aborted: String,
    /// One relayed log line. Placeholders: `{line}`, `{text}`.
    pub log_line: String,
    /// Label of the abort inline button. Placeholders: none.
    pub btn_abort: String,
}

impl Messages {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read messages file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse messages file: {}", path.display()))
    }
}

/// Fills `{name}` placeholders in a template. Placeholders without a matching
/// entry in `vars` are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_placeholders() {
        let text = render(
            "line {line}: {text}",
            &[("line", "3"), ("text", "logging in")],
        );
        assert_eq!(text, "line 3: logging in");
    }

    #[test]
    fn render_repeats_and_keeps_unknown() {
        let text = render("{a} {a} {b}", &[("a", "x")]);
        assert_eq!(text, "x x {b}");
    }

    #[test]
    fn parses_messages_json() {
        let json = r#"{
            "start": "LMSDownloader bot v{version}",
            "usage_error": "Send login, password and link on three lines",
            "wrong_link": "Link must match {regex}",
            "progress": "{log}\nTime left: {remaining}s",
            "done": "Done!\n{log}",
            "done_error": "Failed: {error}\n{log}",
            "done_aborted": "Aborted\n{log}",
            "log_line": "{line}. {text}\n",
            "btn_abort": "Abort"
        }"#;
        let messages: Messages = serde_json::from_str(json).unwrap();
        assert_eq!(
            render(&messages.start, &[("version", "1.0.0")]),
            "LMSDownloader bot v1.0.0"
        );
        assert_eq!(messages.btn_abort, "Abort");
    }
}
