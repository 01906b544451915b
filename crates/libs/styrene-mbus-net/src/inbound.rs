//! Requests arriving on a wire method and the replies sent back for them.

use std::fmt;
use std::sync::{Arc, Weak};

use mbus::{ErrorCode, ErrorEntry, Message, Reply, Trace, Version};

use crate::codec::{ReplyEnvelope, WireCodec};
use crate::network::NetworkCore;
use crate::transport::{Responder, RpcFault, RpcRequest};

pub(crate) struct InboundCall {
    responder: Responder,
    codec: Arc<dyn WireCodec>,
    /// Version the request payload was encoded for; the reply payload uses it too.
    version: Version,
}

impl InboundCall {
    pub(crate) fn abandon(self, core: &NetworkCore, code: ErrorCode, message: &str) {
        respond_error(core, &*self.codec, self.responder, code, message.to_owned());
    }
}

/// Answers one delivered message. Dropping it unanswered sends an error reply.
pub struct ReplySink {
    core: Weak<NetworkCore>,
    call_id: u64,
    answered: bool,
}

impl ReplySink {
    pub fn reply(mut self, reply: Reply) {
        self.answered = true;
        if let Some(core) = self.core.upgrade() {
            complete(&core, self.call_id, reply);
        }
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink").field("call_id", &self.call_id).finish()
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            log::debug!("net({}): request {} dropped without a reply", core.identity, self.call_id);
            complete(
                &core,
                self.call_id,
                Reply::error(ErrorCode::NetworkError, "request was dropped without a reply"),
            );
        }
    }
}

/// Handles one request on `codec`'s method. Runs on the network thread.
pub(crate) fn handle_request(
    core: &Arc<NetworkCore>,
    codec: Arc<dyn WireCodec>,
    request: RpcRequest,
    responder: Responder,
) {
    let envelope = match codec.decode_request(request) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("net({}): malformed {} request: {err}", core.identity, codec.method_name());
            return respond_error(core, &*codec, responder, err.error_code(), err.to_string());
        }
    };
    let Some(owner) = core.owner() else {
        return respond_error(
            core,
            &*codec,
            responder,
            ErrorCode::NetworkError,
            format!("{} has no owner attached", core.identity),
        );
    };
    let Some(protocol) = owner.protocol(&envelope.protocol) else {
        return respond_error(
            core,
            &*codec,
            responder,
            ErrorCode::UnknownProtocol,
            format!("protocol '{}' is not known by {}", envelope.protocol, core.identity),
        );
    };

    let delivery = core.clone();
    core.run(
        protocol.requires_sequencing(),
        Box::new(move || {
            let routable = match protocol.decode(&envelope.version, &envelope.payload) {
                Ok(routable) => routable,
                Err(err) => {
                    return respond_error(
                        &delivery,
                        &*codec,
                        responder,
                        ErrorCode::DecodeError,
                        err.to_string(),
                    );
                }
            };
            let message = Message {
                routable,
                retry: envelope.retry,
                retry_enabled: envelope.retry_enabled,
                time_remaining: envelope.time_remaining,
                trace: Trace::new(envelope.trace_level),
                metadata: envelope.metadata,
            };
            let call_id =
                delivery.inbound.insert(InboundCall { responder, codec, version: envelope.version });
            let sink = ReplySink { core: Arc::downgrade(&delivery), call_id, answered: false };
            owner.deliver_message(message, &envelope.session, sink);
        }),
    );
}

fn complete(core: &NetworkCore, call_id: u64, reply: Reply) {
    let Some(InboundCall { responder, codec, version }) = core.inbound.take(call_id) else {
        log::trace!("net({}): reply to flushed request {call_id} ignored", core.identity);
        return;
    };
    let mut envelope = ReplyEnvelope {
        version,
        retry_delay: reply.retry_delay,
        errors: reply.errors,
        trace: reply.trace.encode(),
        ..ReplyEnvelope::default()
    };
    if let Some(routable) = reply.routable {
        match core.protocol(routable.protocol()) {
            Some(protocol) => match protocol.encode(&version, &*routable) {
                Ok(payload) => {
                    envelope.protocol = protocol.name().to_owned();
                    envelope.payload = payload;
                }
                Err(err) => envelope.errors.push(ErrorEntry::new(ErrorCode::EncodeError, err.to_string())),
            },
            None => envelope.errors.push(ErrorEntry::new(
                ErrorCode::UnknownProtocol,
                format!("reply protocol '{}' is not known", routable.protocol()),
            )),
        }
    }
    respond(&*codec, responder, envelope);
}

fn respond_error(
    core: &NetworkCore,
    codec: &dyn WireCodec,
    responder: Responder,
    code: ErrorCode,
    message: String,
) {
    let envelope = ReplyEnvelope {
        version: core.version,
        errors: vec![ErrorEntry::new(code, message)],
        ..ReplyEnvelope::default()
    };
    respond(codec, responder, envelope);
}

fn respond(codec: &dyn WireCodec, responder: Responder, envelope: ReplyEnvelope) {
    match codec.encode_reply(envelope) {
        Ok(returned) => responder.respond(Ok(returned)),
        Err(err) => responder.respond(Err(RpcFault::Other {
            code: err.error_code().code(),
            message: err.to_string(),
        })),
    }
}
