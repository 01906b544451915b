//! Pooled connection handle and the per-handle version negotiation.
//!
//! The first caller to ask an unresolved handle for its peer's version sends a
//! single `mbus.getVersion` probe; everyone arriving while it is in flight is
//! queued as a waiter. When the probe completes the waiters are swapped out
//! and called outside the lock while the state reads `ProcessingWaiters`;
//! callers arriving in that window block on the condition variable until
//! the fan-out is over and then observe the same outcome, failure included.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mbus::Version;

use crate::transport::{Connection, RpcRequest, RpcResult, RpcValue, GET_VERSION_METHOD};

/// Receives the negotiated version, or `None` if the probe failed.
pub type VersionCallback = Box<dyn FnOnce(Option<Version>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionState {
    Unresolved,
    Invoked,
    ProcessingWaiters,
    Resolved,
}

struct Negotiation {
    state: VersionState,
    version: Option<Version>,
    waiters: Vec<VersionCallback>,
    /// Thread fanning out waiters while `ProcessingWaiters`.
    processing: Option<ThreadId>,
}

pub struct ConnectionHandle {
    spec: String,
    connection: Arc<dyn Connection>,
    negotiation: Mutex<Negotiation>,
    processed: Condvar,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(spec: &str, connection: Arc<dyn Connection>) -> Self {
        Self {
            spec: spec.to_owned(),
            connection,
            negotiation: Mutex::new(Negotiation {
                state: VersionState::Unresolved,
                version: None,
                waiters: Vec::new(),
                processing: None,
            }),
            processed: Condvar::new(),
        }
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> VersionState {
        self.negotiation.lock().expect("negotiation mutex poisoned").state
    }

    pub fn version(&self) -> Option<Version> {
        self.negotiation.lock().expect("negotiation mutex poisoned").version
    }

    /// True while a probe is outstanding or its waiters are being called.
    pub fn is_resolving(&self) -> bool {
        matches!(self.state(), VersionState::Invoked | VersionState::ProcessingWaiters)
    }

    /// A closed connection is only reported invalid once no negotiation is in flight.
    pub fn is_valid(&self) -> bool {
        !self.connection.is_closed() || self.is_resolving()
    }

    /// Delivers the peer's version to `callback`, probing the peer if needed.
    ///
    /// The callback runs inline when the version is known, otherwise on the
    /// network thread once the probe completes. Only the caller that moves the
    /// handle out of `Unresolved` sends a probe.
    pub fn resolve_version(self: &Arc<Self>, timeout: Duration, callback: VersionCallback) {
        let mut negotiation = self.negotiation.lock().expect("negotiation mutex poisoned");
        match negotiation.state {
            VersionState::Resolved => {
                let Some(version) = negotiation.version else {
                    unreachable!("connection handle {} resolved without a version", self.spec);
                };
                drop(negotiation);
                callback(Some(version));
            }
            VersionState::ProcessingWaiters => {
                // A waiter re-entering on the fan-out thread must not wait for itself.
                if negotiation.processing != Some(thread::current().id()) {
                    negotiation = self
                        .processed
                        .wait_while(negotiation, |negotiation| {
                            negotiation.state == VersionState::ProcessingWaiters
                        })
                        .expect("negotiation mutex poisoned");
                }
                let version = negotiation.version;
                drop(negotiation);
                callback(version);
            }
            VersionState::Invoked => negotiation.waiters.push(callback),
            VersionState::Unresolved => {
                negotiation.waiters.push(callback);
                negotiation.state = VersionState::Invoked;
                drop(negotiation);
                self.send_probe(timeout);
            }
        }
    }

    fn send_probe(self: &Arc<Self>, timeout: Duration) {
        log::trace!("handle({}): probing version", self.spec);
        let handle = self.clone();
        self.connection.invoke(
            RpcRequest::new(GET_VERSION_METHOD),
            timeout,
            Box::new(move |result| {
                let version = parse_version_reply(&handle.spec, result);
                handle.complete_probe(version);
            }),
        );
    }

    fn complete_probe(&self, version: Option<Version>) {
        let waiters = {
            let mut negotiation = self.negotiation.lock().expect("negotiation mutex poisoned");
            negotiation.version = version;
            negotiation.state = VersionState::ProcessingWaiters;
            negotiation.processing = Some(thread::current().id());
            std::mem::take(&mut negotiation.waiters)
        };
        for waiter in waiters {
            waiter(version);
        }
        let mut negotiation = self.negotiation.lock().expect("negotiation mutex poisoned");
        negotiation.state =
            if version.is_some() { VersionState::Resolved } else { VersionState::Unresolved };
        negotiation.processing = None;
        drop(negotiation);
        self.processed.notify_all();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        log::trace!("handle({}): closing connection", self.spec);
        self.connection.close();
    }
}

fn parse_version_reply(spec: &str, result: RpcResult) -> Option<Version> {
    let values = match result {
        Ok(reply) => reply.values,
        Err(err) => {
            log::debug!("handle({spec}): version probe failed: {err}");
            return None;
        }
    };
    match values.first() {
        Some(RpcValue::Str(raw)) => match raw.parse() {
            Ok(version) => Some(version),
            Err(err) => {
                log::warn!("handle({spec}): {err}");
                None
            }
        },
        other => {
            log::warn!("handle({spec}): unexpected version reply {other:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests;
