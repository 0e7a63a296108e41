use bifrost_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtprotoError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("invalid did: {0}")]
    InvalidDid(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("repo {0} is inactive")]
    InactiveRepo(String),
    #[error("PLC directory error: {0}")]
    Plc(String),
    #[error("dns resolver error: {0}")]
    Dns(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("websocket error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("CAR decoding error: {0}")]
    CarDecoding(#[from] rs_car::CarDecodeError),
    #[error("IPLD decoding error: {0}")]
    IpldDecoding(#[from] serde_ipld_dagcbor::DecodeError<std::io::Error>),
    #[error("IPLD decoding error: {0}")]
    IpldDecodingSlice(#[from] serde_ipld_dagcbor::DecodeError<std::convert::Infallible>),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0} from {1}")]
    HttpStatus(u16, String),
    #[error("{0}")]
    Value(String),
}

impl AtprotoError {
    /// Whether reconnecting is the right response: transport failures and the
    /// relay telling us we fell behind.
    pub fn is_connection(&self) -> bool {
        matches!(self, AtprotoError::Connection(_) | AtprotoError::Stream(_))
    }
}

pub type Result<T> = core::result::Result<T, AtprotoError>;
