//! Crate-level error type.
//!
//! Component-local failures that callers can meaningfully inspect keep their
//! own enums (see [`crate::runner::client::WebDriverError`]); everything that
//! bubbles up to `main` funnels through [`SitewatchError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SitewatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("bind failed on port {port}: {detail}")]
    Bind { port: u16, detail: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SitewatchError>;
