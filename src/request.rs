use anyhow::Result;

/// One download request: credentials plus the page to fetch, parsed from a
/// single chat message. Dropped as soon as the job ends; never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub login: String,
    pub password: String,
    pub link: String,
}

// Credentials must never reach the logs, so Debug shows the link only.
impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("login", &"<redacted>")
            .field("password", &"<redacted>")
            .field("link", &self.link)
            .finish()
    }
}

impl DownloadRequest {
    /// Parses a message of exactly three non-empty lines: login, password,
    /// link. CRLF line endings and surrounding whitespace are tolerated.
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned = text.replace('\r', "");
        let lines: Vec<&str> = cleaned.trim().lines().map(str::trim).collect();

        if lines.len() != 3 {
            anyhow::bail!("expected 3 lines, got {}", lines.len());
        }
        if lines.iter().any(|line| line.is_empty()) {
            anyhow::bail!("all 3 lines must be non-empty");
        }

        Ok(Self {
            login: lines[0].to_string(),
            password: lines[1].to_string(),
            link: lines[2].to_string(),
        })
    }
}
