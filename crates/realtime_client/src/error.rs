use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("no auth token available to authorize {channel}")]
    NoCredential { channel: String },
    #[error("authorization for {channel} rejected with status {status}")]
    Rejected { channel: String, status: u16 },
    #[error("authorization for {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    #[error("authorization request for {channel} failed: {source}")]
    Request {
        channel: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("authorization response for {channel} is not a JSON object")]
    InvalidResponse { channel: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported broker scheme `{0}`, expected ws or wss")]
    UnsupportedScheme(String),
    #[error("broker app key must not be empty")]
    MissingAppKey,
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
}
