//! Flat positional envelope.
//!
//! Request: version, route, session, retry enabled, retry count, millis
//! remaining, protocol, payload, trace level.
//! Reply: version, retry delay, error codes, error messages, error services,
//! protocol, payload, trace.

use std::time::Duration;

use mbus::ErrorEntry;

use super::{
    parse_wire_version, retry_delay_from_wire, retry_delay_to_wire, ReplyEnvelope,
    RequestEnvelope, ValueReader, WireCodec,
};
use crate::error::NetError;
use crate::transport::{RpcRequest, RpcReturn, RpcValue};

pub const METHOD: &str = "mbus.send1";

const REQUEST_VALUES: usize = 9;
const REPLY_VALUES: usize = 8;

/// Codec for peers older than the structured envelope. Has no slot for metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendV1;

impl WireCodec for SendV1 {
    fn method_name(&self) -> &'static str {
        METHOD
    }

    fn encode_request(&self, envelope: RequestEnvelope) -> Result<RpcRequest, NetError> {
        if !envelope.metadata.is_empty() {
            log::trace!("send1: dropping {} metadata entries", envelope.metadata.len());
        }
        let millis = u64::try_from(envelope.time_remaining.as_millis()).unwrap_or(u64::MAX);
        Ok(RpcRequest::with_params(
            METHOD,
            vec![
                RpcValue::Str(envelope.version.to_string()),
                RpcValue::Str(envelope.route),
                RpcValue::Str(envelope.session),
                RpcValue::U8(u8::from(envelope.retry_enabled)),
                RpcValue::U32(envelope.retry),
                RpcValue::U64(millis),
                RpcValue::Str(envelope.protocol),
                RpcValue::Data(envelope.payload),
                RpcValue::U32(envelope.trace_level),
            ],
        ))
    }

    fn decode_request(&self, request: RpcRequest) -> Result<RequestEnvelope, NetError> {
        let mut values = ValueReader::new(request.params, REQUEST_VALUES)?;
        Ok(RequestEnvelope {
            version: parse_wire_version(&values.string()?)?,
            route: values.string()?,
            session: values.string()?,
            retry_enabled: values.u8()? != 0,
            retry: values.u32()?,
            time_remaining: Duration::from_millis(values.u64()?),
            protocol: values.string()?,
            payload: values.data()?,
            trace_level: values.u32()?,
            metadata: Default::default(),
        })
    }

    fn encode_reply(&self, envelope: ReplyEnvelope) -> Result<RpcReturn, NetError> {
        let mut codes = Vec::with_capacity(envelope.errors.len());
        let mut messages = Vec::with_capacity(envelope.errors.len());
        let mut services = Vec::with_capacity(envelope.errors.len());
        for error in envelope.errors {
            codes.push(error.code);
            messages.push(error.message);
            services.push(error.service);
        }
        Ok(RpcReturn::new(vec![
            RpcValue::Str(envelope.version.to_string()),
            RpcValue::F64(retry_delay_to_wire(envelope.retry_delay)),
            RpcValue::U32Array(codes),
            RpcValue::StrArray(messages),
            RpcValue::StrArray(services),
            RpcValue::Str(envelope.protocol),
            RpcValue::Data(envelope.payload),
            RpcValue::Str(envelope.trace),
        ]))
    }

    fn decode_reply(&self, reply: RpcReturn) -> Result<ReplyEnvelope, NetError> {
        let mut values = ValueReader::new(reply.values, REPLY_VALUES)?;
        let version = parse_wire_version(&values.string()?)?;
        let retry_delay = retry_delay_from_wire(values.f64()?);
        let codes = values.u32_array()?;
        let messages = values.string_array()?;
        let services = values.string_array()?;
        if codes.len() != messages.len() || codes.len() != services.len() {
            return Err(NetError::decode(format!(
                "error arrays disagree: {} codes, {} messages, {} services",
                codes.len(),
                messages.len(),
                services.len()
            )));
        }
        let errors = codes
            .into_iter()
            .zip(messages)
            .zip(services)
            .map(|((code, message), service)| ErrorEntry { code, message, service })
            .collect();
        Ok(ReplyEnvelope {
            version,
            retry_delay,
            errors,
            protocol: values.string()?,
            payload: values.data()?,
            trace: values.string()?,
        })
    }
}
