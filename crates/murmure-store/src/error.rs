use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No platform data directory available")]
    NoDataDir,

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("History decryption failed")]
    DecryptionFailed,

    #[error("History encryption failed")]
    EncryptionFailed,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
