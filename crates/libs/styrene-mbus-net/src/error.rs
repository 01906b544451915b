use mbus::ErrorCode;
use thiserror::Error;

/// Errors returned by fallible network-layer operations.
///
/// Send failures never surface here; they become error replies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("transport failed to start: {0}")]
    TransportStart(String),

    #[error("network already attached to an owner")]
    AlreadyAttached,

    #[error("network has no owner attached")]
    NotAttached,

    #[error("malformed service address '{0}'")]
    InvalidAddress(String),

    #[error("{}: {message}", code.as_str())]
    Codec { code: ErrorCode, message: String },
}

impl NetError {
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Codec { code: ErrorCode::EncodeError, message: message.into() }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Codec { code: ErrorCode::DecodeError, message: message.into() }
    }

    /// The reply error code this failure maps to when it ends a send.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Codec { code, .. } => *code,
            Self::InvalidAddress(_) => ErrorCode::NoAddressForService,
            _ => ErrorCode::NetworkError,
        }
    }
}
