//! Wire envelopes and the version-keyed codec registry.
//!
//! A codec turns a [`RequestEnvelope`] / [`ReplyEnvelope`] into the
//! transport's request/return values and back. Exactly one codec is used per
//! send, picked by the version negotiated for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use mbus::{ErrorCode, ErrorEntry, Version};

use crate::config::CompressionConfig;
use crate::error::NetError;
use crate::transport::{RpcRequest, RpcReturn, RpcValue};

pub mod compression;
pub mod v1;
pub mod v2;

pub use v1::SendV1;
pub use v2::SendV2;

/// Oldest version that understands [`SendV1`].
pub const V1_MIN_VERSION: Version = Version::new(5, 0, 0);

/// Oldest version that understands [`SendV2`].
pub const V2_MIN_VERSION: Version = Version::new(6, 149, 0);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Version the payload was encoded for.
    pub version: Version,
    pub route: String,
    pub session: String,
    pub retry_enabled: bool,
    pub retry: u32,
    pub time_remaining: Duration,
    pub protocol: String,
    pub trace_level: u32,
    pub metadata: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplyEnvelope {
    pub version: Version,
    pub retry_delay: Option<Duration>,
    pub errors: Vec<ErrorEntry>,
    pub protocol: String,
    pub payload: Vec<u8>,
    pub trace: String,
}

pub trait WireCodec: Send + Sync {
    /// RPC method this codec sends requests on and serves.
    fn method_name(&self) -> &'static str;

    fn encode_request(&self, envelope: RequestEnvelope) -> Result<RpcRequest, NetError>;

    fn decode_request(&self, request: RpcRequest) -> Result<RequestEnvelope, NetError>;

    fn encode_reply(&self, envelope: ReplyEnvelope) -> Result<RpcReturn, NetError>;

    fn decode_reply(&self, reply: RpcReturn) -> Result<ReplyEnvelope, NetError>;
}

/// Codecs keyed by the lowest version that understands them.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<Version, Arc<dyn WireCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`SendV1`] and [`SendV2`] at their minimum versions.
    pub fn standard(compression: CompressionConfig) -> Self {
        let mut registry = Self::new();
        registry.register(V1_MIN_VERSION, Arc::new(SendV1));
        registry.register(V2_MIN_VERSION, Arc::new(SendV2::new(compression)));
        registry
    }

    pub fn register(&mut self, min_version: Version, codec: Arc<dyn WireCodec>) {
        self.codecs.insert(min_version, codec);
    }

    /// The codec with the greatest minimum version not above `version`.
    pub fn select(&self, version: &Version) -> Result<Arc<dyn WireCodec>, NetError> {
        self.codecs.range(..=*version).next_back().map(|(_, codec)| codec.clone()).ok_or_else(|| {
            NetError::Codec {
                code: ErrorCode::IncompatibleVersion,
                message: format!("no wire codec supports version {version}"),
            }
        })
    }

    /// Every registered codec by method name, for registering request handlers.
    pub fn by_method(&self) -> HashMap<&'static str, Arc<dyn WireCodec>> {
        self.codecs.values().map(|codec| (codec.method_name(), codec.clone())).collect()
    }
}

/// Reads positional RPC values, failing with a decode error on shape mismatch.
pub(crate) struct ValueReader {
    values: std::vec::IntoIter<RpcValue>,
    position: usize,
}

impl ValueReader {
    pub(crate) fn new(values: Vec<RpcValue>, expected: usize) -> Result<Self, NetError> {
        if values.len() != expected {
            return Err(NetError::decode(format!(
                "expected {expected} values, got {}",
                values.len()
            )));
        }
        Ok(Self { values: values.into_iter(), position: 0 })
    }

    fn next(&mut self, expected: &str) -> Result<RpcValue, NetError> {
        self.position += 1;
        self.values
            .next()
            .ok_or_else(|| NetError::decode(format!("missing value {} ({expected})", self.position)))
    }

    fn mismatch(&self, expected: &str, found: &RpcValue) -> NetError {
        NetError::decode(format!(
            "value {} should be {expected}, found {}",
            self.position,
            found.type_name()
        ))
    }

    pub(crate) fn u8(&mut self) -> Result<u8, NetError> {
        match self.next("u8")? {
            RpcValue::U8(value) => Ok(value),
            other => Err(self.mismatch("u8", &other)),
        }
    }

    pub(crate) fn u32(&mut self) -> Result<u32, NetError> {
        match self.next("u32")? {
            RpcValue::U32(value) => Ok(value),
            other => Err(self.mismatch("u32", &other)),
        }
    }

    pub(crate) fn u64(&mut self) -> Result<u64, NetError> {
        match self.next("u64")? {
            RpcValue::U64(value) => Ok(value),
            other => Err(self.mismatch("u64", &other)),
        }
    }

    pub(crate) fn f64(&mut self) -> Result<f64, NetError> {
        match self.next("f64")? {
            RpcValue::F64(value) => Ok(value),
            other => Err(self.mismatch("f64", &other)),
        }
    }

    pub(crate) fn string(&mut self) -> Result<String, NetError> {
        match self.next("string")? {
            RpcValue::Str(value) => Ok(value),
            other => Err(self.mismatch("string", &other)),
        }
    }

    pub(crate) fn data(&mut self) -> Result<Vec<u8>, NetError> {
        match self.next("data")? {
            RpcValue::Data(value) => Ok(value),
            other => Err(self.mismatch("data", &other)),
        }
    }

    pub(crate) fn u32_array(&mut self) -> Result<Vec<u32>, NetError> {
        match self.next("u32[]")? {
            RpcValue::U32Array(value) => Ok(value),
            other => Err(self.mismatch("u32[]", &other)),
        }
    }

    pub(crate) fn string_array(&mut self) -> Result<Vec<String>, NetError> {
        match self.next("string[]")? {
            RpcValue::StrArray(value) => Ok(value),
            other => Err(self.mismatch("string[]", &other)),
        }
    }
}

pub(crate) fn parse_wire_version(raw: &str) -> Result<Version, NetError> {
    raw.parse().map_err(|err: mbus::BusError| NetError::decode(err.to_string()))
}

/// Seconds on the wire; negative means "no delay given".
pub(crate) fn retry_delay_to_wire(delay: Option<Duration>) -> f64 {
    delay.map_or(-1.0, |delay| delay.as_secs_f64())
}

pub(crate) fn retry_delay_from_wire(seconds: f64) -> Option<Duration> {
    if seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}
