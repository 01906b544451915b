use super::*;
use crate::error::NetError;
use crate::transport::{
    Connection, MethodHandler, NetTask, RepeatingTask, RpcDone, RpcRequest, ScheduledTask,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

struct FakeConnection {
    spec: String,
    closed: AtomicBool,
}

impl Connection for FakeConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn invoke(&self, _request: RpcRequest, _timeout: Duration, _done: RpcDone) {}

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport that only hands out connections and remembers them.
#[derive(Default)]
struct FakeTransport {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    fn created(&self) -> usize {
        self.connections.lock().expect("connections").len()
    }

    fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().expect("connections")[index].clone()
    }
}

impl TransportEndpoint for FakeTransport {
    fn start(&self) -> Result<(), NetError> {
        Ok(())
    }

    fn stop(&self) {}

    fn listen_port(&self) -> Option<u16> {
        None
    }

    fn connect(&self, spec: &str) -> Arc<dyn Connection> {
        let connection =
            Arc::new(FakeConnection { spec: spec.to_owned(), closed: AtomicBool::new(false) });
        self.connections.lock().expect("connections").push(connection.clone());
        connection
    }

    fn register_method(&self, _name: &str, _handler: MethodHandler) {}

    fn post(&self, task: NetTask) -> bool {
        task();
        true
    }

    fn schedule(&self, _interval: Duration, _task: RepeatingTask) -> ScheduledTask {
        ScheduledTask::new()
    }
}

const SPEC: &str = "tcp/host:1234";

fn pool_of(per_target: usize) -> (Arc<FakeTransport>, ConnectionPool) {
    let transport = Arc::new(FakeTransport::default());
    let pool = ConnectionPool::new(transport.clone(), per_target, Duration::from_secs(600));
    (transport, pool)
}

#[test]
fn miss_creates_full_fan_out() {
    let (transport, pool) = pool_of(3);
    let handle = pool.acquire(SPEC);
    assert_eq!(handle.spec(), SPEC);
    assert_eq!(transport.created(), 3);
    assert_eq!(pool.handle_count(SPEC), 3);
    assert_eq!(pool.len(), 1);
}

#[test]
fn round_robin_is_fair() {
    let (_transport, pool) = pool_of(3);
    let mut counts = HashMap::new();
    for _ in 0..10 {
        let handle = pool.acquire(SPEC);
        *counts.entry(Arc::as_ptr(&handle) as usize).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|count| *count >= 10 / 3));
}

#[test]
fn invalid_handle_recreates_the_entry() {
    let (transport, pool) = pool_of(2);
    let first = pool.acquire(SPEC);
    drop(first);
    transport.connection(1).close();

    let fresh = pool.acquire(SPEC);
    assert_eq!(transport.created(), 4, "a fresh pool of two was created");
    assert_eq!(pool.handle_count(SPEC), 2);
    assert!(fresh.is_valid());
    assert!(transport.connection(0).is_closed(), "evicted handles closed their connections");
}

#[test]
fn concurrent_acquire_never_exceeds_fan_out() {
    let (transport, pool) = pool_of(2);
    let pool = Arc::new(pool);
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let handle = pool.acquire(SPEC);
                    assert!(pool.handle_count(SPEC) <= 2);
                    drop(handle);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    assert_eq!(pool.handle_count(SPEC), 2);
    assert_eq!(transport.created(), 2);
}

#[test]
fn flush_evicts_only_idle_expired_entries() {
    let transport = Arc::new(FakeTransport::default());
    let pool = ConnectionPool::new(transport.clone(), 1, Duration::from_secs(10));
    let start = Instant::now();

    let held = pool.acquire_at("tcp/held:1", start);
    drop(pool.acquire_at("tcp/idle:1", start));

    pool.flush_at(false, start + Duration::from_secs(5));
    assert_eq!(pool.len(), 2, "nothing expired yet");

    pool.flush_at(false, start + Duration::from_secs(11));
    assert_eq!(pool.len(), 1, "idle entry expired, held entry is in use");
    assert_eq!(pool.handle_count("tcp/held:1"), 1);

    pool.flush_at(true, start + Duration::from_secs(11));
    assert_eq!(pool.len(), 1, "force never evicts handles in use");

    drop(held);
    pool.flush(true);
    assert!(pool.is_empty());
}

#[test]
fn live_checkout_refreshes_last_use() {
    let transport = Arc::new(FakeTransport::default());
    let pool = ConnectionPool::new(transport, 1, Duration::from_secs(10));
    let start = Instant::now();
    drop(pool.acquire_at(SPEC, start));
    drop(pool.acquire_at(SPEC, start + Duration::from_secs(8)));
    pool.flush_at(false, start + Duration::from_secs(15));
    assert_eq!(pool.len(), 1);
}
