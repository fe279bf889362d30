use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Encoded message is {size} bytes, exceeds the {limit}-byte signaling budget")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Unknown message type `{0}`")]
    UnknownType(String),

    #[error("Malformed signaling payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Malformed(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid node id `{0}`")]
    InvalidNodeId(String),

    #[error("Identity file error: {0}")]
    KeyFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
