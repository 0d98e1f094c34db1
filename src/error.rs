//! Error types for the agent core.
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The error
//! space follows the provider-facing classification the rest of the crate
//! depends on: [`Error::Auth`] and [`Error::Api`] surface immediately, while
//! [`Error::RateLimited`], [`Error::ServerTransient`], [`Error::Timeout`]
//! and [`Error::Connection`] are retryable with exponential backoff (see
//! [`crate::retry`]).

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the agent core
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input from the caller (empty message, malformed attachment,
    /// unsupported media type, oversize payload)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Provider rejected the credentials (401/403)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider returned an explicit 429
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Provider returned a 5xx status
    #[error("Server error: {0}")]
    ServerTransient(String),

    /// Request deadline exceeded
    #[error("Request timeout")]
    Timeout,

    /// Transport-level connection failure
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Non-retryable API error (4xx other than 401/403/429)
    #[error("API error: {0}")]
    Api(String),

    /// Malformed or unexpected data on the streaming channel
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool handler failed
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Session or event persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a new rate-limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Error::RateLimited(msg.into())
    }

    /// Create a new transient server error
    pub fn server_transient(msg: impl Into<String>) -> Self {
        Error::ServerTransient(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a new non-retryable API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether the provider call that produced this error may be retried.
    ///
    /// Rate limits, 5xx statuses, timeouts and connection failures are
    /// transient. Everything else (auth, other 4xx, validation, tool,
    /// storage) surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_)
                | Error::ServerTransient(_)
                | Error::Timeout
                | Error::Connection(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() {
            Error::Connection(err.to_string())
        } else {
            Error::Api(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
