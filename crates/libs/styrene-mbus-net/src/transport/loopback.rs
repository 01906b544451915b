//! In-process transport: endpoints on one [`LoopbackNet`] call each other
//! through their network threads without touching sockets.
//!
//! Each endpoint owns one `std::thread` driving a tokio current-thread
//! runtime. Posted tasks, method handlers, completion callbacks, deadlines
//! and recurring tasks all run there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{
    Connection, MethodHandler, NetTask, RepeatingTask, Responder, RpcDone, RpcFault, RpcRequest,
    RpcResult, ScheduledTask, TransportEndpoint,
};
use crate::error::NetError;

const FIRST_DYNAMIC_PORT: u16 = 20_000;

/// Registry of running loopback endpoints, keyed by connection spec.
pub struct LoopbackNet {
    endpoints: Mutex<HashMap<String, Weak<EndpointCore>>>,
    next_port: AtomicU16,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(FIRST_DYNAMIC_PORT),
        })
    }

    fn lookup(&self, spec: &str) -> Option<Arc<EndpointCore>> {
        self.endpoints
            .lock()
            .expect("loopback endpoints mutex poisoned")
            .get(spec)
            .and_then(Weak::upgrade)
            .filter(|core| core.is_running())
    }

    fn register(&self, spec: String, core: &Arc<EndpointCore>) {
        self.endpoints
            .lock()
            .expect("loopback endpoints mutex poisoned")
            .insert(spec, Arc::downgrade(core));
    }

    fn unregister(&self, spec: &str) {
        self.endpoints.lock().expect("loopback endpoints mutex poisoned").remove(spec);
    }
}

enum Command {
    Run(NetTask),
    Repeat { interval: Duration, task: RepeatingTask, handle: ScheduledTask },
    Stop,
}

struct Runner {
    tx: mpsc::UnboundedSender<Command>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

struct EndpointCore {
    net: Arc<LoopbackNet>,
    spec: String,
    port: u16,
    methods: RwLock<HashMap<String, MethodHandler>>,
    runner: Mutex<Option<Runner>>,
    pending: Mutex<HashMap<u64, RpcDone>>,
    next_call: AtomicU64,
}

impl EndpointCore {
    fn is_running(&self) -> bool {
        self.runner.lock().expect("loopback runner mutex poisoned").is_some()
    }

    fn send(&self, command: Command) -> bool {
        match self.runner.lock().expect("loopback runner mutex poisoned").as_ref() {
            Some(runner) => runner.tx.send(command).is_ok(),
            None => false,
        }
    }

    fn complete(&self, call_id: u64, result: RpcResult) {
        let done = self.pending.lock().expect("loopback pending mutex poisoned").remove(&call_id);
        if let Some(done) = done {
            done(result);
        }
    }

    /// Runs the target side of a call on this endpoint's network thread.
    fn dispatch(self: &Arc<Self>, request: RpcRequest, responder: Responder) {
        if !self.is_running() {
            responder.respond(Err(RpcFault::ConnectionLost(self.spec.clone())));
            return;
        }
        let core = self.clone();
        self.send(Command::Run(Box::new(move || {
            let handler = core
                .methods
                .read()
                .expect("loopback methods lock poisoned")
                .get(&request.method)
                .cloned();
            match handler {
                Some(handler) => handler(request, responder),
                None => responder.respond(Err(RpcFault::NoSuchMethod(request.method))),
            }
        })));
    }
}

/// One endpoint on a [`LoopbackNet`], listening at `tcp/<hostname>:<port>`.
pub struct LoopbackTransport {
    core: Arc<EndpointCore>,
}

impl LoopbackTransport {
    /// Creates an endpoint; port 0 picks the next free loopback port.
    pub fn new(net: &Arc<LoopbackNet>, hostname: &str, port: u16) -> Self {
        let port = if port == 0 { net.next_port.fetch_add(1, Ordering::Relaxed) } else { port };
        Self {
            core: Arc::new(EndpointCore {
                net: net.clone(),
                spec: format!("tcp/{hostname}:{port}"),
                port,
                methods: RwLock::new(HashMap::new()),
                runner: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_call: AtomicU64::new(1),
            }),
        }
    }

    pub fn spec(&self) -> &str {
        &self.core.spec
    }
}

impl TransportEndpoint for LoopbackTransport {
    fn start(&self) -> Result<(), NetError> {
        if self.core.is_running() {
            return Ok(());
        }
        // Checked before taking our runner lock; lookup locks the registry, then runners.
        if self.core.net.lookup(&self.core.spec).is_some() {
            return Err(NetError::TransportStart(format!("{} already in use", self.core.spec)));
        }
        let mut runner = self.core.runner.lock().expect("loopback runner mutex poisoned");
        if runner.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| NetError::TransportStart(err.to_string()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let thread = thread::Builder::new()
            .name(format!("loopback-{}", self.core.port))
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(command) = rx.recv().await {
                        match command {
                            Command::Run(task) => task(),
                            Command::Repeat { interval, mut task, handle } => {
                                tokio::spawn(async move {
                                    let mut ticker = tokio::time::interval(interval);
                                    ticker.tick().await;
                                    loop {
                                        ticker.tick().await;
                                        if handle.is_cancelled() {
                                            break;
                                        }
                                        task();
                                    }
                                });
                            }
                            Command::Stop => break,
                        }
                    }
                });
            })?;
        let thread_id = thread.thread().id();
        *runner = Some(Runner { tx, thread, thread_id });
        drop(runner);
        self.core.net.register(self.core.spec.clone(), &self.core);
        log::debug!("loopback({}): started", self.core.spec);
        Ok(())
    }

    fn stop(&self) {
        let runner = self.core.runner.lock().expect("loopback runner mutex poisoned").take();
        let Some(runner) = runner else {
            return;
        };
        self.core.net.unregister(&self.core.spec);
        let _ = runner.tx.send(Command::Stop);
        if thread::current().id() != runner.thread_id && runner.thread.join().is_err() {
            log::error!("loopback({}): network thread panicked", self.core.spec);
        }
        let abandoned: Vec<RpcDone> = self
            .core
            .pending
            .lock()
            .expect("loopback pending mutex poisoned")
            .drain()
            .map(|(_, done)| done)
            .collect();
        if !abandoned.is_empty() {
            log::debug!("loopback({}): stopped with {} calls in flight", self.core.spec, abandoned.len());
        }
        for done in abandoned {
            done(Err(RpcFault::ConnectionLost(format!("{} stopped", self.core.spec))));
        }
    }

    fn listen_port(&self) -> Option<u16> {
        self.core.is_running().then_some(self.core.port)
    }

    fn connect(&self, spec: &str) -> Arc<dyn Connection> {
        Arc::new(LoopbackConnection {
            caller: self.core.clone(),
            spec: spec.to_owned(),
            closed: AtomicBool::new(false),
        })
    }

    fn register_method(&self, name: &str, handler: MethodHandler) {
        self.core
            .methods
            .write()
            .expect("loopback methods lock poisoned")
            .insert(name.to_owned(), handler);
    }

    fn post(&self, task: NetTask) -> bool {
        self.core.send(Command::Run(task))
    }

    fn schedule(&self, interval: Duration, task: RepeatingTask) -> ScheduledTask {
        let handle = ScheduledTask::new();
        if !self.core.send(Command::Repeat { interval, task, handle: handle.clone() }) {
            handle.cancel();
        }
        handle
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopbackConnection {
    caller: Arc<EndpointCore>,
    spec: String,
    closed: AtomicBool,
}

impl Connection for LoopbackConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn invoke(&self, request: RpcRequest, timeout: Duration, done: RpcDone) {
        let caller = self.caller.clone();
        let call_id = caller.next_call.fetch_add(1, Ordering::Relaxed);
        caller.pending.lock().expect("loopback pending mutex poisoned").insert(call_id, done);

        let spec = self.spec.clone();
        let closed = self.closed.load(Ordering::Acquire);
        let task_caller = caller.clone();
        let posted = caller.send(Command::Run(Box::new(move || {
            let timer = task_caller.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer.complete(call_id, Err(RpcFault::Timeout));
            });

            let target = if closed { None } else { task_caller.net.lookup(&spec) };
            let Some(target) = target else {
                task_caller.complete(call_id, Err(RpcFault::ConnectionLost(spec)));
                return;
            };
            let reply_to = task_caller.clone();
            target.dispatch(
                request,
                Responder::new(move |result| {
                    let core = reply_to.clone();
                    reply_to.send(Command::Run(Box::new(move || core.complete(call_id, result))));
                }),
            );
        })));
        if !posted {
            caller.complete(call_id, Err(RpcFault::ConnectionLost("transport not running".into())));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.caller.net.lookup(&self.spec).is_none()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RpcReturn, RpcValue};
    use std::sync::mpsc as std_mpsc;

    fn echo_endpoint(net: &Arc<LoopbackNet>) -> LoopbackTransport {
        let server = LoopbackTransport::new(net, "localhost", 0);
        server.register_method(
            "echo",
            Arc::new(|request: RpcRequest, responder: Responder| {
                responder.respond(Ok(RpcReturn::new(request.params)));
            }),
        );
        server.start().expect("start server");
        server
    }

    #[test]
    fn invoke_reaches_registered_method() {
        let net = LoopbackNet::new();
        let server = echo_endpoint(&net);
        let client = LoopbackTransport::new(&net, "localhost", 0);
        client.start().expect("start client");

        let (tx, rx) = std_mpsc::channel();
        let connection = client.connect(server.spec());
        connection.invoke(
            RpcRequest::with_params("echo", vec![RpcValue::U32(7)]),
            Duration::from_secs(5),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(result, Ok(RpcReturn::new(vec![RpcValue::U32(7)])));
    }

    #[test]
    fn unknown_method_and_missing_target_fail() {
        let net = LoopbackNet::new();
        let server = echo_endpoint(&net);
        let client = LoopbackTransport::new(&net, "localhost", 0);
        client.start().expect("start client");

        let (tx, rx) = std_mpsc::channel();
        let tx2 = tx.clone();
        client.connect(server.spec()).invoke(
            RpcRequest::new("missing"),
            Duration::from_secs(5),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("completion"),
            Err(RpcFault::NoSuchMethod("missing".into()))
        );

        let ghost = client.connect("tcp/nowhere:1");
        assert!(ghost.is_closed());
        ghost.invoke(
            RpcRequest::new("echo"),
            Duration::from_secs(5),
            Box::new(move |result| {
                let _ = tx2.send(result);
            }),
        );
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).expect("completion"),
            Err(RpcFault::ConnectionLost(_))
        ));
    }

    #[test]
    fn unanswered_invocation_times_out() {
        let net = LoopbackNet::new();
        let server = LoopbackTransport::new(&net, "localhost", 0);
        let parked = Arc::new(Mutex::new(Vec::new()));
        let sink = parked.clone();
        server.register_method(
            "sink",
            Arc::new(move |_request: RpcRequest, responder: Responder| {
                sink.lock().expect("sink").push(responder);
            }),
        );
        server.start().expect("start server");
        let client = LoopbackTransport::new(&net, "localhost", 0);
        client.start().expect("start client");

        let (tx, rx) = std_mpsc::channel();
        client.connect(server.spec()).invoke(
            RpcRequest::new("sink"),
            Duration::from_millis(50),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("completion"), Err(RpcFault::Timeout));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "exactly one completion");
    }

    #[test]
    fn stop_unregisters_and_rejects_posts() {
        let net = LoopbackNet::new();
        let server = echo_endpoint(&net);
        let client = LoopbackTransport::new(&net, "localhost", 0);
        client.start().expect("start client");
        let connection = client.connect(server.spec());
        assert!(!connection.is_closed());
        server.stop();
        assert!(connection.is_closed());
        assert!(server.listen_port().is_none());
        assert!(!server.post(Box::new(|| {})));
    }

    #[test]
    fn stop_fails_calls_still_in_flight() {
        let net = LoopbackNet::new();
        let server = LoopbackTransport::new(&net, "localhost", 0);
        let parked = Arc::new(Mutex::new(Vec::new()));
        let sink = parked.clone();
        server.register_method(
            "sink",
            Arc::new(move |_request: RpcRequest, responder: Responder| {
                sink.lock().expect("sink").push(responder);
            }),
        );
        server.start().expect("start server");
        let client = LoopbackTransport::new(&net, "localhost", 0);
        client.start().expect("start client");

        let (tx, rx) = std_mpsc::channel();
        client.connect(server.spec()).invoke(
            RpcRequest::new("sink"),
            Duration::from_secs(30),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while parked.lock().expect("sink").is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(parked.lock().expect("sink").len(), 1);

        client.stop();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).expect("completion"),
            Err(RpcFault::ConnectionLost(_))
        ));
        parked.lock().expect("sink").clear();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "exactly one completion");
    }
}
