use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::address::{is_literal_address, ServiceAddress};
use crate::naming::NameMirror;

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Outcome of resolving one pattern, kept until the mirror changes.
#[derive(Debug)]
struct CachedService {
    address: Option<ServiceAddress>,
    tick: u64,
}

/// Bounded LRU keyed by pattern. `order` maps recency tick to pattern.
#[derive(Debug)]
struct ServiceCache {
    capacity: usize,
    generation: Option<u64>,
    entries: HashMap<String, CachedService>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl ServiceCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            generation: None,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn sync_generation(&mut self, generation: u64) {
        if self.generation != Some(generation) {
            if !self.entries.is_empty() {
                log::debug!("resolver: mirror generation {generation}, dropping {} entries", self.entries.len());
            }
            self.entries.clear();
            self.order.clear();
            self.generation = Some(generation);
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn get(&mut self, pattern: &str) -> Option<Option<ServiceAddress>> {
        // Small working sets never reorder.
        let promote = self.entries.len() > self.capacity / 2;
        let tick = if promote { Some(self.tick()) } else { None };
        let entry = self.entries.get_mut(pattern)?;
        if let Some(tick) = tick {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, pattern.to_owned());
        }
        Some(entry.address.clone())
    }

    fn insert(&mut self, pattern: &str, address: Option<ServiceAddress>) {
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        let tick = self.tick();
        self.order.insert(tick, pattern.to_owned());
        self.entries.insert(pattern.to_owned(), CachedService { address, tick });
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Turns service patterns into unbound [`ServiceAddress`]es.
pub struct ServiceResolver {
    mirror: Arc<dyn NameMirror>,
    cache: Mutex<ServiceCache>,
}

impl ServiceResolver {
    pub fn new(mirror: Arc<dyn NameMirror>, capacity: usize) -> Self {
        Self { mirror, cache: Mutex::new(ServiceCache::new(capacity)) }
    }

    /// Resolves `pattern`, or `None` when nothing (or more than one service) matches.
    ///
    /// Misses are cached too; the whole cache is dropped the next time the
    /// mirror's generation differs from the one it was filled under.
    pub fn resolve(&self, pattern: &str) -> Option<ServiceAddress> {
        let generation = self.mirror.updates();
        let mut cache = self.cache.lock().expect("service cache mutex poisoned");
        cache.sync_generation(generation);
        if let Some(cached) = cache.get(pattern) {
            return cached;
        }
        // The lookup runs under the cache lock so concurrent misses on the same
        // pattern cost one mirror query.
        let address = self.lookup(pattern);
        cache.insert(pattern, address.clone());
        address
    }

    fn lookup(&self, pattern: &str) -> Option<ServiceAddress> {
        if is_literal_address(pattern) {
            return match ServiceAddress::parse_literal(pattern) {
                Ok(address) => Some(address),
                Err(err) => {
                    log::warn!("resolver: {err}");
                    None
                }
            };
        }
        let mut matches = self.mirror.lookup(pattern);
        if matches.len() > 1 {
            log::error!("resolver: pattern '{pattern}' matched {} services, expected one", matches.len());
            return None;
        }
        let (name, spec) = matches.pop()?;
        match ServiceAddress::new(&name, &spec) {
            Ok(address) => Some(address),
            Err(err) => {
                log::warn!("resolver: mirror returned {err}");
                None
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().expect("service cache mutex poisoned").len()
    }
}
