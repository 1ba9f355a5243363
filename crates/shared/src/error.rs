use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed broker payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("broker event `{event}` carried no data")]
    MissingData { event: String },
}
