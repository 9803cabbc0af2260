use thiserror::Error;

/// Failures surfaced by the analysis client and its helpers.
///
/// The workflow never shows these to the user directly; they are logged and
/// folded into a single static message (see `workflow::BACKEND_UNREACHABLE`).
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}")]
    Status {
        status: reqwest::StatusCode,
        detail: Option<String>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("could not decode response body: {0}")]
    Decode(String),

    #[error("no image selected")]
    MissingImage,

    #[error("artifact is not an image (content-type: {0})")]
    NotAnImage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Transport(err)
        }
    }

    /// Connection-level failures are the only ones worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_connect())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
