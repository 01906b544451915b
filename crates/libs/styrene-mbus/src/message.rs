use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ErrorCode, ErrorEntry};
use crate::protocol::Routable;
use crate::trace::Trace;

/// An outbound or inbound message together with its delivery state.
#[derive(Debug)]
pub struct Message {
    pub routable: Box<dyn Routable>,
    pub retry: u32,
    pub retry_enabled: bool,
    /// Budget left before the sender gives up; becomes the call deadline.
    pub time_remaining: Duration,
    pub trace: Trace,
    /// Key/value context that is never compressed on the wire.
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(routable: Box<dyn Routable>, time_remaining: Duration) -> Self {
        Self {
            routable,
            retry: 0,
            retry_enabled: true,
            time_remaining,
            trace: Trace::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn protocol(&self) -> &str {
        self.routable.protocol()
    }
}

/// The answer to a [`Message`], possibly carrying errors instead of a payload.
#[derive(Debug, Default)]
pub struct Reply {
    /// Protocol of `routable`; empty for replies without a payload.
    pub protocol: String,
    pub routable: Option<Box<dyn Routable>>,
    pub errors: Vec<ErrorEntry>,
    /// Delay the sender should observe before resending; `None` leaves it to policy.
    pub retry_delay: Option<Duration>,
    pub trace: Trace,
}

impl Reply {
    pub fn new(routable: Box<dyn Routable>) -> Self {
        Self { protocol: routable.protocol().to_owned(), routable: Some(routable), ..Self::default() }
    }

    /// A reply that carries only the given error.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut reply = Self::default();
        reply.add_error(ErrorEntry::new(code, message));
        reply
    }

    pub fn add_error(&mut self, error: ErrorEntry) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.errors.iter().any(|error| !crate::error::is_transient_code(error.code))
    }

    /// First error of the given kind, if any.
    pub fn find_error(&self, code: ErrorCode) -> Option<&ErrorEntry> {
        self.errors.iter().find(|error| error.code == code.code())
    }
}
