//! The transport endpoint the network layer runs on.
//!
//! Socket I/O, the event loop and raw RPC invocation live behind
//! [`TransportEndpoint`] and [`Connection`]. All completion callbacks and
//! scheduled tasks run on the transport's network thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::NetError;

pub mod loopback;

/// Probe answered with the callee's protocol version string.
pub const GET_VERSION_METHOD: &str = "mbus.getVersion";

/// A single RPC parameter or return value.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcValue {
    U8(u8),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
    Data(Vec<u8>),
    U32Array(Vec<u32>),
    StrArray(Vec<String>),
}

impl RpcValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "u8",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
            Self::Data(_) => "data",
            Self::U32Array(_) => "u32[]",
            Self::StrArray(_) => "string[]",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<RpcValue>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Vec::new() }
    }

    pub fn with_params(method: impl Into<String>, params: Vec<RpcValue>) -> Self {
        Self { method: method.into(), params }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcReturn {
    pub values: Vec<RpcValue>,
}

impl RpcReturn {
    pub fn new(values: Vec<RpcValue>) -> Self {
        Self { values }
    }
}

/// Transport-level failure of one invocation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RpcFault {
    #[error("invocation timed out")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no such method '{0}'")]
    NoSuchMethod(String),

    #[error("rpc error {code}: {message}")]
    Other { code: u32, message: String },
}

pub type RpcResult = Result<RpcReturn, RpcFault>;

/// Completion callback of an outbound invocation; runs on the network thread.
pub type RpcDone = Box<dyn FnOnce(RpcResult) + Send>;

/// Work posted to the network thread.
pub type NetTask = Box<dyn FnOnce() + Send>;

pub type RepeatingTask = Box<dyn FnMut() + Send>;

/// Answers one inbound invocation. May be used from any thread, once.
pub struct Responder {
    done: Box<dyn FnOnce(RpcResult) + Send>,
}

impl Responder {
    pub fn new(done: impl FnOnce(RpcResult) + Send + 'static) -> Self {
        Self { done: Box::new(done) }
    }

    pub fn respond(self, result: RpcResult) {
        (self.done)(result)
    }
}

/// Handler for an inbound method, called on the network thread.
pub type MethodHandler = Arc<dyn Fn(RpcRequest, Responder) + Send + Sync>;

/// Cancellation handle of a recurring task.
#[derive(Clone, Debug, Default)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A client-side connection to one connection spec.
pub trait Connection: Send + Sync {
    fn spec(&self) -> &str;

    /// Invokes `request` asynchronously. `done` is called exactly once unless the
    /// transport is stopped first.
    fn invoke(&self, request: RpcRequest, timeout: Duration, done: RpcDone);

    fn is_closed(&self) -> bool;

    fn close(&self);
}

pub trait TransportEndpoint: Send + Sync {
    fn start(&self) -> Result<(), NetError>;

    /// Stops the network thread and waits for it to exit.
    fn stop(&self);

    fn listen_port(&self) -> Option<u16>;

    fn connect(&self, spec: &str) -> Arc<dyn Connection>;

    fn register_method(&self, name: &str, handler: MethodHandler);

    /// Runs `task` on the network thread. Returns `false` if the transport is not running.
    fn post(&self, task: NetTask) -> bool;

    /// Runs `task` on the network thread every `interval` until cancelled or stopped.
    fn schedule(&self, interval: Duration, task: RepeatingTask) -> ScheduledTask;
}
