//! The network facade a message bus drives: attach, start, send, shutdown.

use std::sync::{mpsc, Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mbus::{ErrorCode, ErrorEntry, Message, Protocol, Reply, Trace, Version};

use crate::codec::CodecRegistry;
use crate::config::NetworkConfig;
use crate::error::NetError;
use crate::executor::Executor;
use crate::inbound::{self, InboundCall, ReplySink};
use crate::naming::{NameMirror, NameRegister};
use crate::pending::PendingTable;
use crate::pool::ConnectionPool;
use crate::resolver::ServiceResolver;
use crate::send::{self, OutboundCall, Recipient, RecipientToken};
use crate::transport::{
    NetTask, Responder, RpcRequest, RpcReturn, RpcValue, ScheduledTask, TransportEndpoint,
    GET_VERSION_METHOD,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The bus side of a [`RpcNetwork`].
///
/// Called from the network thread or the executor, never while the network
/// holds a lock.
pub trait NetworkOwner: Send + Sync {
    fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>>;

    /// A request for the local session `session`. Answer it through `reply`.
    fn deliver_message(&self, message: Message, session: &str, reply: ReplySink);

    /// The outcome of one recipient of an earlier [`RpcNetwork::send`].
    fn deliver_reply(&self, reply: Reply, token: RecipientToken);
}

/// State shared between the facade, its method handlers and in-flight calls.
pub(crate) struct NetworkCore {
    pub(crate) identity: String,
    pub(crate) version: Version,
    hostname: String,
    listen_port: u16,
    pub(crate) transport: Arc<dyn TransportEndpoint>,
    mirror: Arc<dyn NameMirror>,
    register: Arc<dyn NameRegister>,
    pub(crate) resolver: ServiceResolver,
    pub(crate) pool: ConnectionPool,
    pub(crate) codecs: CodecRegistry,
    executor: Executor,
    owner: OnceLock<Weak<dyn NetworkOwner>>,
    pub(crate) outbound: PendingTable<OutboundCall>,
    pub(crate) inbound: PendingTable<InboundCall>,
}

impl NetworkCore {
    pub(crate) fn owner(&self) -> Option<Arc<dyn NetworkOwner>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    pub(crate) fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.owner()?.protocol(name)
    }

    /// Runs decode-and-deliver inline for sequenced protocols, else on the executor.
    pub(crate) fn run(&self, sequenced: bool, task: NetTask) {
        if sequenced {
            task();
        } else {
            self.executor.execute(task);
        }
    }

    pub(crate) fn deliver_reply(&self, reply: Reply, token: RecipientToken) {
        match self.owner() {
            Some(owner) => owner.deliver_reply(reply, token),
            None => log::warn!("net({}): no owner for reply to recipient {token}", self.identity),
        }
    }

    pub(crate) fn deliver_error(
        &self,
        token: RecipientToken,
        service: &str,
        code: ErrorCode,
        message: &str,
        trace_level: u32,
    ) {
        log::debug!("net({}): {} for '{service}': {message}", self.identity, code.as_str());
        let mut reply = Reply { trace: Trace::new(trace_level), ..Reply::default() };
        reply.add_error(ErrorEntry::new(code, message).with_service(service));
        self.deliver_reply(reply, token);
    }

    /// Like [`Self::deliver_error`], but from the network thread when it is running.
    pub(crate) fn post_error(
        self: &Arc<Self>,
        token: RecipientToken,
        service: &str,
        code: ErrorCode,
        message: String,
        trace_level: u32,
    ) {
        let core = self.clone();
        let service = service.to_owned();
        let posted_service = service.clone();
        let posted_message = message.clone();
        let posted = self.transport.post(Box::new(move || {
            core.deliver_error(token, &posted_service, code, &posted_message, trace_level);
        }));
        if !posted {
            self.deliver_error(token, &service, code, &message, trace_level);
        }
    }

    fn connection_spec(&self) -> String {
        let port = self.transport.listen_port().unwrap_or(self.listen_port);
        format!("tcp/{}:{port}", self.hostname)
    }
}

/// RPC network beneath a message bus.
///
/// Construct it with a transport and naming service, [`attach`](Self::attach)
/// the owning bus, then [`start`](Self::start). Tear down with
/// [`shutdown`](Self::shutdown) followed by
/// [`post_shutdown_hook`](Self::post_shutdown_hook).
pub struct RpcNetwork {
    core: Arc<NetworkCore>,
    sweep: Mutex<Option<ScheduledTask>>,
    sweep_interval: Duration,
}

impl RpcNetwork {
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn TransportEndpoint>,
        mirror: Arc<dyn NameMirror>,
        register: Arc<dyn NameRegister>,
    ) -> Result<Self, NetError> {
        config.validate()?;
        let version = config.parsed_version()?;
        let core = NetworkCore {
            resolver: ServiceResolver::new(mirror.clone(), config.service_cache_capacity),
            pool: ConnectionPool::new(
                transport.clone(),
                config.connections_per_target,
                config.connection_expire(),
            ),
            codecs: CodecRegistry::standard(config.compression.clone()),
            executor: Executor::new(config.executor_threads)?,
            identity: config.identity.clone(),
            version,
            hostname: config.hostname.clone(),
            listen_port: config.listen_port,
            transport,
            mirror,
            register,
            owner: OnceLock::new(),
            outbound: PendingTable::new(),
            inbound: PendingTable::new(),
        };
        Ok(Self {
            core: Arc::new(core),
            sweep: Mutex::new(None),
            sweep_interval: config.pool_sweep_interval(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn version(&self) -> Version {
        self.core.version
    }

    /// Binds the owning bus and registers the wire methods. Allowed once.
    pub fn attach(&self, owner: &Arc<dyn NetworkOwner>) -> Result<(), NetError> {
        self.core.owner.set(Arc::downgrade(owner)).map_err(|_| NetError::AlreadyAttached)?;

        let reply = RpcReturn::new(vec![RpcValue::Str(self.core.version.to_string())]);
        self.core.transport.register_method(
            GET_VERSION_METHOD,
            Arc::new(move |_request: RpcRequest, responder: Responder| {
                responder.respond(Ok(reply.clone()));
            }),
        );
        for (method, codec) in self.core.codecs.by_method() {
            let core = Arc::downgrade(&self.core);
            self.core.transport.register_method(
                method,
                Arc::new(move |request: RpcRequest, responder: Responder| match core.upgrade() {
                    Some(core) => inbound::handle_request(&core, codec.clone(), request, responder),
                    None => log::debug!("net: request on {method} after teardown"),
                }),
            );
        }
        log::debug!("net({}): attached at version {}", self.core.identity, self.core.version);
        Ok(())
    }

    /// Starts the transport and the periodic pool sweep.
    pub fn start(&self) -> Result<(), NetError> {
        if self.core.owner.get().is_none() {
            return Err(NetError::NotAttached);
        }
        self.core.transport.start()?;
        let core = Arc::downgrade(&self.core);
        let sweep = self.core.transport.schedule(
            self.sweep_interval,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.pool.flush(false);
                }
            }),
        );
        let previous = self.sweep.lock().expect("sweep mutex poisoned").replace(sweep);
        if let Some(previous) = previous {
            previous.cancel();
        }
        log::info!("net({}): listening at {}", self.core.identity, self.connection_spec());
        Ok(())
    }

    /// Blocks until the naming service reports ready, or `timeout` passes.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.core.mirror.ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(READY_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Publishes `session` as `<identity>/<session>` at this network's spec.
    pub fn register_session(&self, session: &str) {
        let name = self.session_name(session);
        self.core.register.register_name(&name, &self.connection_spec());
        log::debug!("net({}): registered {name}", self.core.identity);
    }

    pub fn unregister_session(&self, session: &str) {
        let name = self.session_name(session);
        self.core.register.unregister_name(&name, &self.connection_spec());
        log::debug!("net({}): unregistered {name}", self.core.identity);
    }

    fn session_name(&self, session: &str) -> String {
        format!("{}/{session}", self.core.identity)
    }

    /// Sends `message` to every recipient. Never blocks on the network; each
    /// recipient's outcome arrives through [`NetworkOwner::deliver_reply`].
    pub fn send(&self, message: Message, recipients: Vec<Recipient>) {
        send::send(&self.core, message, recipients);
    }

    /// Waits until everything queued on the network thread so far has run.
    ///
    /// Must not be called from a network callback.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        let posted = self.core.transport.post(Box::new(move || {
            let _ = tx.send(());
        }));
        if posted && rx.recv().is_err() {
            log::debug!("net({}): transport stopped during sync", self.core.identity);
        }
    }

    /// Stops scheduled work and the transport, then drops idle connections.
    pub fn shutdown(&self) {
        if let Some(sweep) = self.sweep.lock().expect("sweep mutex poisoned").take() {
            sweep.cancel();
        }
        self.core.transport.stop();
        self.core.pool.flush(true);
        log::info!("net({}): shut down", self.core.identity);
    }

    /// Resolves every call the stopped transport will never complete, then
    /// stops the executor.
    pub fn post_shutdown_hook(&self) {
        let outbound = self.core.outbound.drain();
        let inbound = self.core.inbound.drain();
        if !outbound.is_empty() || !inbound.is_empty() {
            log::debug!(
                "net({}): flushing {} outbound and {} inbound calls",
                self.core.identity,
                outbound.len(),
                inbound.len()
            );
        }
        for call in outbound {
            call.abandon(&self.core, ErrorCode::NetworkShutdown, "network was shut down");
        }
        for call in inbound {
            call.abandon(&self.core, ErrorCode::NetworkShutdown, "network was shut down");
        }
        self.core.executor.shutdown();
    }

    /// Externally reachable `tcp/<host>:<port>` of this network.
    pub fn connection_spec(&self) -> String {
        self.core.connection_spec()
    }

    /// Calls sent and not yet completed.
    pub fn pending_sends(&self) -> usize {
        self.core.outbound.len()
    }

    /// Requests delivered and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.core.inbound.len()
    }

    pub fn pooled_targets(&self) -> usize {
        self.core.pool.len()
    }
}
