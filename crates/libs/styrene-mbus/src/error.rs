use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First code of the transient range; failures in this range may succeed on resend.
pub const TRANSIENT_ERROR: u32 = 100_000;

/// First code of the fatal range.
pub const FATAL_ERROR: u32 = 200_000;

/// Failure kinds produced by the network layer.
///
/// Codes are stable on the wire. Application protocols may put their own codes
/// in a reply; those are carried as plain numbers in [`ErrorEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    Timeout,
    ConnectionError,
    NoAddressForService,
    HandshakeFailed,
    NetworkError,
    NetworkShutdown,
    IncompatibleVersion,
    EncodeError,
    DecodeError,
    UnknownProtocol,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            Self::Timeout => TRANSIENT_ERROR + 1,
            Self::ConnectionError => TRANSIENT_ERROR + 2,
            Self::NoAddressForService => TRANSIENT_ERROR + 3,
            Self::HandshakeFailed => TRANSIENT_ERROR + 4,
            Self::NetworkError => TRANSIENT_ERROR + 5,
            Self::NetworkShutdown => FATAL_ERROR + 1,
            Self::IncompatibleVersion => FATAL_ERROR + 2,
            Self::EncodeError => FATAL_ERROR + 3,
            Self::DecodeError => FATAL_ERROR + 4,
            Self::UnknownProtocol => FATAL_ERROR + 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        [
            Self::Timeout,
            Self::ConnectionError,
            Self::NoAddressForService,
            Self::HandshakeFailed,
            Self::NetworkError,
            Self::NetworkShutdown,
            Self::IncompatibleVersion,
            Self::EncodeError,
            Self::DecodeError,
            Self::UnknownProtocol,
        ]
        .into_iter()
        .find(|candidate| candidate.code() == code)
    }

    pub fn is_transient(self) -> bool {
        is_transient_code(self.code())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::NoAddressForService => "NO_ADDRESS_FOR_SERVICE",
            Self::HandshakeFailed => "HANDSHAKE_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::NetworkShutdown => "NETWORK_SHUTDOWN",
            Self::IncompatibleVersion => "INCOMPATIBLE_VERSION",
            Self::EncodeError => "ENCODE_ERROR",
            Self::DecodeError => "DECODE_ERROR",
            Self::UnknownProtocol => "UNKNOWN_PROTOCOL",
        }
    }
}

/// Codes in `[TRANSIENT_ERROR, FATAL_ERROR)` are transient, application codes included.
pub fn is_transient_code(code: u32) -> bool {
    (TRANSIENT_ERROR..FATAL_ERROR).contains(&code)
}

/// One error carried by a reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: u32,
    pub message: String,
    /// Service that produced the error; empty when raised locally.
    pub service: String,
}

impl ErrorEntry {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.code(), message: message.into(), service: String::new() }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// Errors raised by protocol implementations and boundary parsing.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BusError {
    #[error("invalid version string '{0}'")]
    InvalidVersion(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
