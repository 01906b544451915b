use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::handle::ConnectionHandle;
use crate::transport::TransportEndpoint;

/// Fixed-size round-robin set of handles for one connection spec.
struct PoolEntry {
    handles: Vec<Arc<ConnectionHandle>>,
    cursor: usize,
    last_use: Instant,
}

impl PoolEntry {
    fn next_handle(&mut self) -> Arc<ConnectionHandle> {
        let handle = self.handles[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.handles.len();
        handle
    }

    /// The pool's own reference is the only one for every idle handle.
    fn in_use(&self) -> bool {
        self.handles.iter().any(|handle| Arc::strong_count(handle) > 1)
    }
}

/// Pooled connection handles keyed by connection spec.
///
/// One mutex guards the map. Handles are never dropped while it is held:
/// dropping a handle closes its connection, which takes transport locks.
pub struct ConnectionPool {
    transport: Arc<dyn TransportEndpoint>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    per_target: usize,
    expire: Duration,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn TransportEndpoint>, per_target: usize, expire: Duration) -> Self {
        Self { transport, entries: Mutex::new(HashMap::new()), per_target: per_target.max(1), expire }
    }

    pub fn acquire(&self, spec: &str) -> Arc<ConnectionHandle> {
        self.acquire_at(spec, Instant::now())
    }

    pub(crate) fn acquire_at(&self, spec: &str, now: Instant) -> Arc<ConnectionHandle> {
        let stale;
        let handle;
        {
            let mut entries = self.entries.lock().expect("connection pool mutex poisoned");
            if let Some(entry) = entries.get_mut(spec) {
                let candidate = entry.next_handle();
                if candidate.is_valid() {
                    entry.last_use = now;
                    return candidate;
                }
                log::debug!("pool: connection to {spec} went invalid, reconnecting");
                stale = entries.remove(spec).map(|entry| (entry, candidate));
            } else {
                stale = None;
            }
            let handles: Vec<_> = (0..self.per_target)
                .map(|_| Arc::new(ConnectionHandle::new(spec, self.transport.connect(spec))))
                .collect();
            let mut entry = PoolEntry { handles, cursor: 0, last_use: now };
            handle = entry.next_handle();
            entries.insert(spec.to_owned(), entry);
        }
        drop(stale);
        handle
    }

    /// Evicts entries with no handle in use that are idle past expiry, or all
    /// such entries when `force` is set.
    pub fn flush(&self, force: bool) {
        self.flush_at(force, Instant::now());
    }

    pub(crate) fn flush_at(&self, force: bool, now: Instant) {
        let victims: Vec<PoolEntry> = {
            let mut entries = self.entries.lock().expect("connection pool mutex poisoned");
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.in_use()
                        && (force || now.saturating_duration_since(entry.last_use) > self.expire)
                })
                .map(|(spec, _)| spec.clone())
                .collect();
            expired.iter().filter_map(|spec| entries.remove(spec)).collect()
        };
        if !victims.is_empty() {
            log::debug!("pool: evicting {} idle connection targets", victims.len());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("connection pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of handles pooled for `spec`.
    pub fn handle_count(&self, spec: &str) -> usize {
        self.entries
            .lock()
            .expect("connection pool mutex poisoned")
            .get(spec)
            .map_or(0, |entry| entry.handles.len())
    }
}

#[cfg(test)]
mod tests;
