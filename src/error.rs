use reqwest::StatusCode;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = PushError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("Subscription name already exists, but the server returned no usable id")]
    SubscriptionConflict,

    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("Handshake Error: {0}")]
    HandshakeError(String),

    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    #[error("HTTP Request Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("WebSocket Protocol Error: {0}")]
    TungsteniteError(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for PushError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PushError::TungsteniteError(Box::new(err))
    }
}
