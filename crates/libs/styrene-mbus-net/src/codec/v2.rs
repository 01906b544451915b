//! Structured envelope.
//!
//! Requests and replies are six values: header encoding, header decoded size,
//! header bytes, then the same three for the body. Both parts are MessagePack
//! maps. The header is never compressed; the body may be.

use std::collections::BTreeMap;
use std::time::Duration;

use mbus::ErrorEntry;
use serde::{Deserialize, Serialize};

use super::compression::{compress, decompress, Compressed};
use super::{
    parse_wire_version, retry_delay_from_wire, retry_delay_to_wire, ReplyEnvelope,
    RequestEnvelope, ValueReader, WireCodec,
};
use crate::config::CompressionConfig;
use crate::error::NetError;
use crate::transport::{RpcRequest, RpcReturn, RpcValue};

pub const METHOD: &str = "mbus.slime";

const FRAME_VALUES: usize = 6;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireHeader {
    #[serde(rename = "m", default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestBody {
    #[serde(rename = "v")]
    version: String,
    #[serde(rename = "r")]
    route: String,
    #[serde(rename = "s")]
    session: String,
    #[serde(rename = "re")]
    retry_enabled: bool,
    #[serde(rename = "rc")]
    retry: u32,
    #[serde(rename = "t")]
    time_remaining_ms: u64,
    #[serde(rename = "p")]
    protocol: String,
    #[serde(rename = "tl")]
    trace_level: u32,
    #[serde(rename = "b", with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireError {
    #[serde(rename = "c")]
    code: u32,
    #[serde(rename = "m")]
    message: String,
    #[serde(rename = "s", default)]
    service: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplyBody {
    #[serde(rename = "v")]
    version: String,
    #[serde(rename = "d")]
    retry_delay: f64,
    #[serde(rename = "e", default)]
    errors: Vec<WireError>,
    #[serde(rename = "p")]
    protocol: String,
    #[serde(rename = "b", with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(rename = "t", default)]
    trace: String,
}

/// Codec carrying metadata and an optionally compressed body.
#[derive(Clone, Debug, Default)]
pub struct SendV2 {
    compression: CompressionConfig,
}

impl SendV2 {
    pub fn new(compression: CompressionConfig) -> Self {
        Self { compression }
    }

    fn write_frame<H: Serialize, B: Serialize>(
        &self,
        header: &H,
        body: &B,
    ) -> Result<Vec<RpcValue>, NetError> {
        let header = rmp_serde::to_vec_named(header).map_err(|err| NetError::encode(err.to_string()))?;
        let body = rmp_serde::to_vec_named(body).map_err(|err| NetError::encode(err.to_string()))?;
        let mut values = Vec::with_capacity(FRAME_VALUES);
        push_part(&mut values, Compressed::raw(header))?;
        push_part(&mut values, compress(&self.compression, body))?;
        Ok(values)
    }
}

fn push_part(values: &mut Vec<RpcValue>, part: Compressed) -> Result<(), NetError> {
    let decoded_size = u32::try_from(part.decoded_size)
        .map_err(|_| NetError::encode(format!("part of {} bytes is too large", part.decoded_size)))?;
    values.push(RpcValue::U8(part.kind.id()));
    values.push(RpcValue::U32(decoded_size));
    values.push(RpcValue::Data(part.bytes));
    Ok(())
}

fn read_part(values: &mut ValueReader) -> Result<Vec<u8>, NetError> {
    let kind = values.u8()?;
    let decoded_size = values.u32()?;
    let bytes = values.data()?;
    decompress(kind, decoded_size, bytes)
}

fn read_frame<H, B>(values: Vec<RpcValue>) -> Result<(H, B), NetError>
where
    H: for<'de> Deserialize<'de>,
    B: for<'de> Deserialize<'de>,
{
    let mut values = ValueReader::new(values, FRAME_VALUES)?;
    let header_bytes = read_part(&mut values)?;
    let body_bytes = read_part(&mut values)?;
    let header = rmp_serde::from_slice(&header_bytes)
        .map_err(|err| NetError::decode(format!("header: {err}")))?;
    let body =
        rmp_serde::from_slice(&body_bytes).map_err(|err| NetError::decode(format!("body: {err}")))?;
    Ok((header, body))
}

impl WireCodec for SendV2 {
    fn method_name(&self) -> &'static str {
        METHOD
    }

    fn encode_request(&self, envelope: RequestEnvelope) -> Result<RpcRequest, NetError> {
        let header = WireHeader { metadata: envelope.metadata };
        let body = RequestBody {
            version: envelope.version.to_string(),
            route: envelope.route,
            session: envelope.session,
            retry_enabled: envelope.retry_enabled,
            retry: envelope.retry,
            time_remaining_ms: u64::try_from(envelope.time_remaining.as_millis())
                .unwrap_or(u64::MAX),
            protocol: envelope.protocol,
            trace_level: envelope.trace_level,
            payload: envelope.payload,
        };
        Ok(RpcRequest::with_params(METHOD, self.write_frame(&header, &body)?))
    }

    fn decode_request(&self, request: RpcRequest) -> Result<RequestEnvelope, NetError> {
        let (header, body): (WireHeader, RequestBody) = read_frame(request.params)?;
        Ok(RequestEnvelope {
            version: parse_wire_version(&body.version)?,
            route: body.route,
            session: body.session,
            retry_enabled: body.retry_enabled,
            retry: body.retry,
            time_remaining: Duration::from_millis(body.time_remaining_ms),
            protocol: body.protocol,
            trace_level: body.trace_level,
            metadata: header.metadata,
            payload: body.payload,
        })
    }

    fn encode_reply(&self, envelope: ReplyEnvelope) -> Result<RpcReturn, NetError> {
        let body = ReplyBody {
            version: envelope.version.to_string(),
            retry_delay: retry_delay_to_wire(envelope.retry_delay),
            errors: envelope
                .errors
                .into_iter()
                .map(|error| WireError {
                    code: error.code,
                    message: error.message,
                    service: error.service,
                })
                .collect(),
            protocol: envelope.protocol,
            payload: envelope.payload,
            trace: envelope.trace,
        };
        Ok(RpcReturn::new(self.write_frame(&WireHeader::default(), &body)?))
    }

    fn decode_reply(&self, reply: RpcReturn) -> Result<ReplyEnvelope, NetError> {
        let (_header, body): (WireHeader, ReplyBody) = read_frame(reply.values)?;
        Ok(ReplyEnvelope {
            version: parse_wire_version(&body.version)?,
            retry_delay: retry_delay_from_wire(body.retry_delay),
            errors: body
                .errors
                .into_iter()
                .map(|error| ErrorEntry {
                    code: error.code,
                    message: error.message,
                    service: error.service,
                })
                .collect(),
            protocol: body.protocol,
            payload: body.payload,
            trace: body.trace,
        })
    }
}
