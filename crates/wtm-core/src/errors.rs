/// Core error type for the timed-message scheduler.
///
/// Adapter crates should map their specific errors into this type so the
/// core can handle failures consistently (user-facing message vs. fault).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Validation failures whose message is shown to the user verbatim.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
