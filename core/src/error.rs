use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid connection URI: {0}")]
    InvalidConnectionUri(String),

    #[error("Bech32 error: {0}")]
    Bech32Error(String),

    #[error("Signature error: {0}")]
    SignatureError(String),

    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("Decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("Relay transport error: {0}")]
    RelayTransportError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Wallet error {code}: {message}")]
    NwcError { code: String, message: String },

    #[error("Queue corrupted: {0}")]
    QueueCorrupted(String),

    #[error("Processing lease held by {owner} until {expires_at}")]
    LeaseHeld { owner: String, expires_at: u64 },

    #[error("Processing lease {0} was lost")]
    LeaseLost(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("No payment verification method configured")]
    NoVerificationMethod,

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// 通信系のエラーか（キュー処理で項目単位に握りつぶしてよいもの）
    pub fn is_transport(&self) -> bool {
        matches!(self, CoreError::RelayTransportError(_) | CoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::ParseError(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::RelayTransportError(error.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::StorageError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
