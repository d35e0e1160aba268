use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed upstream payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("upstream closed the stream without a final chunk")]
    Truncated,

    #[error("upstream line exceeded {limit} bytes")]
    LineTooLong { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid userId parameter: {0:?} is not an integer")]
    Invalid(String),

    #[error("invalid userId parameter: {0} is out of range")]
    OutOfRange(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read hot content: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse hot content: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to read session file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse session file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} must be at most {max_secs} seconds")]
    TooLong { name: &'static str, max_secs: u64 },

    #[error("invalid listen address {0:?}")]
    Listen(String),
}
