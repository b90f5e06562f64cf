use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The origin could not be reached at all.
    #[error("Network unreachable: {0}")]
    Unreachable(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl NetworkError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a failed send: connection failures mean the origin is
    /// unreachable, anything else is a transport error.
    pub fn from_send(err: reqwest::Error) -> Self {
        if err.is_connect() {
            let target = err.url().map(|u| u.to_string()).unwrap_or_else(|| err.to_string());
            NetworkError::Unreachable(target)
        } else {
            NetworkError::Transport(err)
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            404 => NetworkError::NotFound(truncated),
            429 => NetworkError::RateLimited,
            500..=599 => NetworkError::ServerError(truncated),
            code => NetworkError::Status {
                status: code,
                body: truncated,
            },
        }
    }
}
