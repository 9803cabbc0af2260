//! Turns an artifact name reported by the backend into a displayable URL.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

/// Same escape set as `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_artifact_name(name: &str) -> String {
    utf8_percent_encode(name, COMPONENT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatmapReference {
    url: Url,
    artifact_name: String,
    token: i64,
}

impl HeatmapReference {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    pub fn token(&self) -> i64 {
        self.token
    }
}

impl fmt::Display for HeatmapReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Builds heatmap references against a `/files/` base.
///
/// Tokens are wall-clock milliseconds, bumped when needed so that every
/// reference this projector hands out carries a strictly larger token than
/// the one before it.
#[derive(Debug)]
pub struct HeatmapProjector {
    files_base: Url,
    last_token: AtomicI64,
}

impl HeatmapProjector {
    pub fn new(files_base: Url) -> Self {
        Self {
            files_base,
            last_token: AtomicI64::new(i64::MIN),
        }
    }

    pub fn project(&self, artifact_name: &str) -> HeatmapReference {
        let token = self.next_token();
        let mut url = self.files_base.clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            encode_artifact_name(artifact_name)
        );
        url.set_path(&path);
        url.set_query(Some(&format!("t={token}")));
        HeatmapReference {
            url,
            artifact_name: artifact_name.to_string(),
            token,
        }
    }

    fn next_token(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }
}
