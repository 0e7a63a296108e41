use bifrost_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NostrError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("bech32 error: {0}")]
    Bech32(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("websocket error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay error: {0}")]
    Relay(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0} from {1}")]
    HttpStatus(u16, String),
}

impl NostrError {
    pub fn is_connection(&self) -> bool {
        matches!(self, NostrError::Connection(_) | NostrError::Relay(_))
    }
}

pub type Result<T> = core::result::Result<T, NostrError>;
