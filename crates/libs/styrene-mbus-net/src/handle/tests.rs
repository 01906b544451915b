use super::*;
use crate::transport::{RpcDone, RpcFault, RpcReturn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

/// Connection that parks every invocation until the test completes it.
#[derive(Default)]
struct ScriptedConnection {
    calls: Mutex<Vec<(RpcRequest, RpcDone)>>,
    closed: AtomicBool,
}

impl ScriptedConnection {
    fn request_count(&self) -> usize {
        self.calls.lock().expect("calls").len()
    }

    fn complete_next(&self, result: RpcResult) {
        let (request, done) = self.calls.lock().expect("calls").remove(0);
        assert_eq!(request.method, GET_VERSION_METHOD);
        done(result);
    }
}

impl Connection for ScriptedConnection {
    fn spec(&self) -> &str {
        "tcp/scripted:1"
    }

    fn invoke(&self, request: RpcRequest, _timeout: Duration, done: RpcDone) {
        self.calls.lock().expect("calls").push((request, done));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn version_reply(version: &str) -> RpcResult {
    Ok(RpcReturn::new(vec![RpcValue::Str(version.to_owned())]))
}

fn collecting_callback(tx: &mpsc::Sender<Option<Version>>) -> VersionCallback {
    let tx = tx.clone();
    Box::new(move |version| {
        let _ = tx.send(version);
    })
}

#[test]
fn concurrent_resolvers_share_one_version_request() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            let callback = collecting_callback(&tx);
            thread::spawn(move || handle.resolve_version(Duration::from_secs(1), callback))
        })
        .collect();
    for caller in callers {
        caller.join().expect("caller");
    }
    assert_eq!(connection.request_count(), 1);
    assert_eq!(handle.state(), VersionState::Invoked);
    assert!(rx.try_recv().is_err(), "no callback before the version reply");

    connection.complete_next(version_reply("7.2.1"));
    let seen: Vec<_> = (0..8).map(|_| rx.recv().expect("callback")).collect();
    assert!(seen.iter().all(|version| *version == Some(Version::new(7, 2, 1))));
    assert_eq!(handle.state(), VersionState::Resolved);
}

#[test]
fn resolved_handle_answers_inline() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();
    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    connection.complete_next(version_reply("8.0.0"));
    assert_eq!(rx.recv().expect("first"), Some(Version::new(8, 0, 0)));

    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    assert_eq!(rx.try_recv().expect("inline"), Some(Version::new(8, 0, 0)));
    assert_eq!(connection.request_count(), 0);
    assert_eq!(handle.version(), Some(Version::new(8, 0, 0)));
}

#[test]
fn failed_version_request_reports_none_and_allows_retry() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();

    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    connection.complete_next(Err(RpcFault::Timeout));
    assert_eq!(rx.recv().expect("first"), None);
    assert_eq!(rx.recv().expect("second"), None);
    assert_eq!(handle.state(), VersionState::Unresolved);

    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    assert_eq!(connection.request_count(), 1, "retry sends a fresh request");
    connection.complete_next(version_reply("6.200"));
    assert_eq!(rx.recv().expect("retry"), Some(Version::new(6, 200, 0)));
}

#[test]
fn unparseable_version_counts_as_failure() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();
    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    connection.complete_next(version_reply("not-a-version"));
    assert_eq!(rx.recv().expect("callback"), None);
    assert_eq!(handle.state(), VersionState::Unresolved);
}

#[test]
fn waiter_may_reenter_during_fan_out() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();
    let inner_tx = tx.clone();
    let reentrant = handle.clone();
    handle.resolve_version(
        Duration::from_secs(1),
        Box::new(move |_| {
            reentrant.resolve_version(Duration::from_secs(1), collecting_callback(&inner_tx));
        }),
    );
    connection.complete_next(version_reply("7.0.0"));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("inline"), Some(Version::new(7, 0, 0)));
    drop(tx);
}

#[test]
fn closed_connection_is_invalid_only_when_idle() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, _rx) = mpsc::channel();
    handle.resolve_version(Duration::from_secs(1), collecting_callback(&tx));
    connection.close();
    assert!(handle.is_valid(), "mid-resolution handles stay valid");
    connection.complete_next(Err(RpcFault::ConnectionLost("gone".into())));
    assert!(!handle.is_valid());
}

#[test]
fn dropping_the_handle_closes_its_connection() {
    let connection = Arc::new(ScriptedConnection::default());
    drop(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    assert!(connection.is_closed());
}

#[test]
fn caller_blocked_during_fan_out_sees_the_failure_without_a_second_request() {
    let connection = Arc::new(ScriptedConnection::default());
    let handle = Arc::new(ConnectionHandle::new("tcp/scripted:1", connection.clone()));
    let (tx, rx) = mpsc::channel();
    let (started_tx, started_rx) = mpsc::channel();
    let late = Arc::new(Mutex::new(None));

    let spawner = handle.clone();
    let late_slot = late.clone();
    let late_tx = tx.clone();
    handle.resolve_version(
        Duration::from_secs(1),
        Box::new(move |version| {
            let blocked = spawner.clone();
            let callback = collecting_callback(&late_tx);
            let started = started_tx.clone();
            *late_slot.lock().expect("late") = Some(thread::spawn(move || {
                let _ = started.send(());
                blocked.resolve_version(Duration::from_secs(1), callback);
            }));
            started_rx.recv().expect("late caller started");
            // Let the late caller reach the condition variable.
            thread::sleep(Duration::from_millis(100));
            let _ = late_tx.send(version);
        }),
    );
    connection.complete_next(Err(RpcFault::Timeout));

    let caller = late.lock().expect("late").take().expect("late caller spawned");
    caller.join().expect("late caller");
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("first waiter"), None);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("late caller"), None);
    assert_eq!(connection.request_count(), 0, "no request after the failed fan-out");
    assert_eq!(handle.state(), VersionState::Unresolved);
}
