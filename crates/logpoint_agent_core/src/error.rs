use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Message decryption failed")]
    Decryption,

    #[error("Message decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Credential signing failed: {0}")]
    Signer(String),

    #[error("Dispatch table incomplete: no handler for '{0}'")]
    Dispatch(String),

    #[error(transparent)]
    Rejected(#[from] LogpointError),
}

impl AgentError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wire error code reported to the relay for per-message protocol failures.
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            Self::Decryption => Some("MESSAGE_DECRYPTION_FAILED"),
            Self::Decompression(_) => Some("MESSAGE_DECOMPRESSION_FAILED"),
            Self::Rejected(reason) => Some(reason.code()),
            _ => None,
        }
    }
}

/// Reasons a logpoint is refused at add time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogpointError {
    #[error("File does not exist.")]
    FileNotFound,

    #[error("Invalid file path provided.")]
    OutsideWebroot,

    #[error(
        "File contents in the production environment differ. Make sure you are using the \
         identical version when setting logpoints."
    )]
    HashMismatch,

    #[error("Log expression is missing or empty.")]
    LogVariableMissing,

    #[error("Field '{0}' contains control characters.")]
    ControlCharacters(&'static str),

    #[error("Invalid logpoint request: {0}")]
    InvalidRequest(String),
}

impl LogpointError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::OutsideWebroot => "OUTSIDE_WEBROOT",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::LogVariableMissing => "LOG_VARIABLE_MISSING",
            Self::ControlCharacters(_) => "INVALID_CHARACTERS",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}
