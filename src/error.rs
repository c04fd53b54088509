use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame arrived but its content could not be decoded.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Test error: {0}")]
    Test(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs a channel operation bounded by `limit`, mapping expiry to
/// [`Error::Timeout`] naming `what`.
pub(crate) async fn with_timeout<T, F>(limit: std::time::Duration, what: &str, op: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(format!("{} after {:?}", what, limit))),
    }
}
