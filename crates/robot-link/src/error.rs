use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("invalid endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error("serial port {path}: {source}")]
    Serial {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),
}

impl LinkError {
    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.to_owned(),
            reason: reason.to_string(),
        }
    }
}
