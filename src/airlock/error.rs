use thiserror::Error;

/// Errors talking to a ship over its HTTP API
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("login failed: {0}")]
    Login(String),

    #[error("poke rejected: {0}")]
    PokeRejected(String),

    #[error("channel closed")]
    Closed,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Result type alias for airlock operations
pub type Result<T> = std::result::Result<T, Error>;
