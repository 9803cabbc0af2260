use std::time::Duration;

use url::Url;

use crate::error::{ClientError, Result};

pub const DEFAULT_API_BASE: &str = "http://localhost:5001";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: Url,
    pub timeout: Duration,
    // Zero disables retrying.
    pub retry_window: Duration,
}

impl ClientConfig {
    pub fn new(api_base: &str) -> Result<Self> {
        Ok(Self {
            api_base: parse_base(api_base)?,
            timeout: DEFAULT_TIMEOUT,
            retry_window: Duration::ZERO,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    /// Longest one analysis may take, retries included.
    pub fn deadline(&self) -> Duration {
        self.timeout + self.retry_window
    }

    pub fn analyze_url(&self) -> Url {
        join_path(&self.api_base, "analyze")
    }

    pub fn files_base(&self) -> Url {
        join_path(&self.api_base, "files/")
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::Config(format!(
            "api base must be an http(s) url, got {raw}"
        )));
    }
    Ok(url)
}

// Url::join drops the last segment of a base without a trailing slash, so
// "http://host/api" + "analyze" would lose "api".
fn join_path(base: &Url, tail: &str) -> Url {
    let mut joined = base.clone();
    joined.set_query(None);
    joined.set_fragment(None);
    let path = format!("{}/{}", joined.path().trim_end_matches('/'), tail);
    joined.set_path(&path);
    joined
}
