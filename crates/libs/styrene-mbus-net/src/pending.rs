use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Calls awaiting exactly one terminal outcome.
///
/// Whoever takes an entry first owns its completion; later takers get `None`.
pub(crate) struct PendingTable<T> {
    entries: Mutex<HashMap<u64, T>>,
    next_id: AtomicU64,
}

impl<T> PendingTable<T> {
    pub(crate) fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn insert(&self, entry: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("pending table mutex poisoned").insert(id, entry);
        id
    }

    pub(crate) fn take(&self, id: u64) -> Option<T> {
        self.entries.lock().expect("pending table mutex poisoned").remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        self.entries.lock().expect("pending table mutex poisoned").drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("pending table mutex poisoned").len()
    }
}
