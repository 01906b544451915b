//! Outbound sends.
//!
//! Every recipient is resolved and bound to a pooled handle, then all handles
//! negotiate their peer version concurrently. The send is encoded once, for
//! the lowest negotiated version, and one call per recipient shares that
//! payload. A single failed negotiation fails the whole send.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mbus::{ErrorCode, ErrorEntry, Message, Reply, Trace, Version};

use crate::address::ServiceAddress;
use crate::codec::{RequestEnvelope, WireCodec};
use crate::network::NetworkCore;
use crate::transport::{RpcFault, RpcResult};

/// Caller-chosen tag echoed back with the recipient's reply.
pub type RecipientToken = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub token: RecipientToken,
    /// Service pattern or literal address.
    pub service: String,
    /// Route string carried to the recipient unchanged.
    pub route: String,
}

impl Recipient {
    pub fn new<T: Into<String>>(token: RecipientToken, service: T) -> Self {
        Self { token, service: service.into(), route: String::new() }
    }

    pub fn with_route<T: Into<String>>(mut self, route: T) -> Self {
        self.route = route.into();
        self
    }
}

struct Target {
    recipient: Recipient,
    address: ServiceAddress,
}

/// An invocation in flight; the pooled handle stays checked out until it completes.
pub(crate) struct OutboundCall {
    token: RecipientToken,
    address: ServiceAddress,
    codec: Arc<dyn WireCodec>,
    trace_level: u32,
}

impl OutboundCall {
    /// Terminal result for a call the transport will never complete.
    pub(crate) fn abandon(mut self, core: &NetworkCore, code: ErrorCode, message: &str) {
        drop(self.address.release_handle());
        core.deliver_error(self.token, self.address.service_name(), code, message, self.trace_level);
    }
}

struct SendState {
    message: Option<Message>,
    targets: Vec<Target>,
    version: Option<Version>,
    failed: bool,
}

/// Collects the negotiated versions of one send; dispatches when the last arrives.
struct SendContext {
    core: Arc<NetworkCore>,
    started: Instant,
    pending: AtomicUsize,
    state: Mutex<SendState>,
}

pub(crate) fn send(core: &Arc<NetworkCore>, message: Message, recipients: Vec<Recipient>) {
    let trace_level = message.trace.level();
    let mut targets = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let Some(mut address) = core.resolver.resolve(&recipient.service) else {
            core.post_error(
                recipient.token,
                &recipient.service,
                ErrorCode::NoAddressForService,
                format!("no address for service '{}'", recipient.service),
                trace_level,
            );
            continue;
        };
        address.bind(core.pool.acquire(address.connection_spec()));
        targets.push(Target { recipient, address });
    }
    if targets.is_empty() {
        return;
    }
    if message.time_remaining.is_zero() {
        for target in targets {
            core.post_error(
                target.recipient.token,
                target.address.service_name(),
                ErrorCode::Timeout,
                "message timed out before it was sent".to_owned(),
                trace_level,
            );
        }
        return;
    }

    let timeout = message.time_remaining;
    let handles: Vec<_> = targets.iter().filter_map(|target| target.address.handle().cloned()).collect();
    let context = Arc::new(SendContext {
        core: core.clone(),
        started: Instant::now(),
        pending: AtomicUsize::new(handles.len()),
        state: Mutex::new(SendState { message: Some(message), targets, version: None, failed: false }),
    });
    for handle in handles {
        let context = context.clone();
        let spec = handle.spec().to_owned();
        handle.resolve_version(
            timeout,
            Box::new(move |version| context.version_resolved(&spec, version)),
        );
    }
}

impl SendContext {
    fn version_resolved(&self, spec: &str, version: Option<Version>) {
        {
            let mut state = self.state.lock().expect("send context mutex poisoned");
            match version {
                Some(version) => {
                    state.version = Some(state.version.map_or(version, |known| known.min(version)));
                }
                None => {
                    log::debug!("net({}): version negotiation with {spec} failed", self.core.identity);
                    state.failed = true;
                }
            }
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.dispatch();
        }
    }

    fn dispatch(&self) {
        let (message, targets, version, failed) = {
            let mut state = self.state.lock().expect("send context mutex poisoned");
            (state.message.take(), std::mem::take(&mut state.targets), state.version, state.failed)
        };
        let Some(message) = message else {
            unreachable!("send context dispatched twice");
        };
        let trace_level = message.trace.level();
        let fail_all = |targets: Vec<Target>, code: ErrorCode, reason: String| {
            for target in targets {
                self.core.post_error(
                    target.recipient.token,
                    target.address.service_name(),
                    code,
                    reason.clone(),
                    trace_level,
                );
            }
        };

        if failed {
            return fail_all(
                targets,
                ErrorCode::HandshakeFailed,
                "version negotiation failed for at least one recipient".to_owned(),
            );
        }
        let Some(version) = version else {
            unreachable!("every negotiation succeeded without yielding a version");
        };
        let codec = match self.core.codecs.select(&version) {
            Ok(codec) => codec,
            Err(err) => return fail_all(targets, err.error_code(), err.to_string()),
        };
        let remaining = message.time_remaining.saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            return fail_all(targets, ErrorCode::Timeout, "timed out during version negotiation".to_owned());
        }
        let protocol_name = message.protocol().to_owned();
        let Some(protocol) = self.core.protocol(&protocol_name) else {
            return fail_all(
                targets,
                ErrorCode::UnknownProtocol,
                format!("protocol '{protocol_name}' is not known"),
            );
        };
        let mut payload = match protocol.encode(&version, &*message.routable) {
            Ok(payload) => payload,
            Err(err) => return fail_all(targets, ErrorCode::EncodeError, err.to_string()),
        };

        log::trace!(
            "net({}): sending {protocol_name} to {} recipients at {version} via {}",
            self.core.identity,
            targets.len(),
            codec.method_name()
        );
        let last = targets.len() - 1;
        for (index, target) in targets.into_iter().enumerate() {
            let payload = if index == last { std::mem::take(&mut payload) } else { payload.clone() };
            let envelope = RequestEnvelope {
                version,
                route: target.recipient.route.clone(),
                session: target.address.session_name().to_owned(),
                retry_enabled: message.retry_enabled,
                retry: message.retry,
                time_remaining: remaining,
                protocol: protocol_name.clone(),
                trace_level,
                metadata: message.metadata.clone(),
                payload,
            };
            invoke(&self.core, target, codec.clone(), envelope, remaining, trace_level);
        }
    }
}

fn invoke(
    core: &Arc<NetworkCore>,
    target: Target,
    codec: Arc<dyn WireCodec>,
    envelope: RequestEnvelope,
    timeout: Duration,
    trace_level: u32,
) {
    let Target { recipient, address } = target;
    let request = match codec.encode_request(envelope) {
        Ok(request) => request,
        Err(err) => {
            core.post_error(recipient.token, address.service_name(), err.error_code(), err.to_string(), trace_level);
            return;
        }
    };
    let Some(connection) = address.handle().map(|handle| handle.connection().clone()) else {
        unreachable!("recipient {} dispatched without a connection handle", address.service_name());
    };
    let call_id =
        core.outbound.insert(OutboundCall { token: recipient.token, address, codec, trace_level });
    let weak: Weak<NetworkCore> = Arc::downgrade(core);
    connection.invoke(
        request,
        timeout,
        Box::new(move |result| {
            if let Some(core) = weak.upgrade() {
                complete(&core, call_id, result);
            }
        }),
    );
}

fn complete(core: &Arc<NetworkCore>, call_id: u64, result: RpcResult) {
    let Some(call) = core.outbound.take(call_id) else {
        log::trace!("net({}): ignoring completion of flushed call {call_id}", core.identity);
        return;
    };
    let OutboundCall { token, mut address, codec, trace_level } = call;
    drop(address.release_handle());
    let service = address.service_name().to_owned();

    let returned = match result {
        Ok(returned) => returned,
        Err(fault) => {
            let code = match fault {
                RpcFault::Timeout => ErrorCode::Timeout,
                RpcFault::ConnectionLost(_) => ErrorCode::ConnectionError,
                _ => ErrorCode::NetworkError,
            };
            core.deliver_error(token, &service, code, &fault.to_string(), trace_level);
            return;
        }
    };
    let envelope = match codec.decode_reply(returned) {
        Ok(envelope) => envelope,
        Err(err) => {
            core.deliver_error(token, &service, err.error_code(), &err.to_string(), trace_level);
            return;
        }
    };

    let mut reply = Reply {
        retry_delay: envelope.retry_delay,
        trace: Trace::decode(trace_level, &envelope.trace),
        ..Reply::default()
    };
    for mut error in envelope.errors {
        if error.service.is_empty() {
            error.service = service.clone();
        }
        reply.add_error(error);
    }
    if envelope.payload.is_empty() {
        core.deliver_reply(reply, token);
        return;
    }
    let Some(protocol) = core.protocol(&envelope.protocol) else {
        reply.add_error(
            ErrorEntry::new(
                ErrorCode::UnknownProtocol,
                format!("reply protocol '{}' is not known", envelope.protocol),
            )
            .with_service(service),
        );
        core.deliver_reply(reply, token);
        return;
    };

    let version = envelope.version;
    let payload = envelope.payload;
    let protocol_name = envelope.protocol;
    let delivery = core.clone();
    core.run(
        protocol.requires_sequencing(),
        Box::new(move || {
            match protocol.decode(&version, &payload) {
                Ok(routable) => {
                    reply.protocol = protocol_name;
                    reply.routable = Some(routable);
                }
                Err(err) => {
                    reply.add_error(ErrorEntry::new(ErrorCode::DecodeError, err.to_string()).with_service(service));
                }
            }
            delivery.deliver_reply(reply, token);
        }),
    );
}
