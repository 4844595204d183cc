//! End-to-end tests of the wire protocol, concurrency, and lifecycle.

mod common;

use common::{local_config, start, wait_until, Client};
use linecap::{Config, EncodingPolicy, ServerState, ShutdownPolicy, TransformKind};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

#[test]
fn test_hello_is_uppercased() {
    let server = start(local_config());
    let mut client = Client::connect(server.local_addr());

    assert_eq!(client.request("hello"), "HELLO\n");

    drop(client);
    server.shutdown().unwrap();
}

#[test]
fn test_responses_follow_request_order() {
    let server = start(local_config());
    let mut client = Client::connect(server.local_addr());

    assert_eq!(client.request("a"), "A\n");
    assert_eq!(client.request("b"), "B\n");

    let lines: Vec<String> = (0..25).map(|i| format!("this is line {i} from a bunch")).collect();
    for line in &lines {
        assert_eq!(client.request(line), format!("{}\n", line.to_uppercase()));
    }

    client.close_write();
    assert!(client.read_to_end().unwrap().is_empty());
    assert!(wait_until(|| server.stats().completed == 1));
    assert_eq!(server.stats().lines, 27);

    server.shutdown().unwrap();
}

#[test]
fn test_empty_connection_ends_cleanly() {
    let server = start(local_config());
    let addr = server.local_addr();

    drop(TcpStream::connect(addr).unwrap());
    assert!(wait_until(|| server.stats().completed == 1));
    assert_eq!(server.stats().lines, 0);

    // Still accepting
    let mut client = Client::connect(addr);
    assert_eq!(client.request("still here"), "STILL HERE\n");

    drop(client);
    server.shutdown().unwrap();
}

#[test]
fn test_partial_line_gets_no_response() {
    let server = start(local_config());
    let mut client = Client::connect(server.local_addr());

    client.send_raw(b"no delimiter");
    client.close_write();
    assert!(client.read_to_end().unwrap().is_empty());
    assert!(wait_until(|| server.stats().completed == 1));

    let mut next = Client::connect(server.local_addr());
    assert_eq!(next.request("next"), "NEXT\n");

    drop(next);
    server.shutdown().unwrap();
}

#[test]
fn test_no_cross_talk_between_connections() {
    let server = start(local_config());
    let mut a = Client::connect(server.local_addr());
    let mut b = Client::connect(server.local_addr());

    a.send_raw(b"from a one\n");
    b.send_raw(b"from b one\n");
    assert_eq!(b.recv(), "FROM B ONE\n");
    assert_eq!(a.recv(), "FROM A ONE\n");

    assert_eq!(a.request("from a two"), "FROM A TWO\n");
    assert_eq!(b.request("from b two"), "FROM B TWO\n");

    drop(a);
    drop(b);
    server.shutdown().unwrap();
}

#[test]
fn test_fifty_concurrent_clients() {
    let server = start(local_config());
    let addr = server.local_addr();

    let clients: Vec<_> = (0..50)
        .map(|id| {
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                for n in 0..10 {
                    let line = format!("client {id} line {n}");
                    assert_eq!(client.request(&line), format!("CLIENT {id} LINE {n}\n"));
                    thread::sleep(Duration::from_millis(1 + fastrand::u64(0..3)));
                }
            })
        })
        .collect();

    for client in clients {
        client.join().expect("client thread");
    }

    assert!(wait_until(|| server.stats().completed == 50));
    let stats = server.stats();
    assert_eq!(stats.accepted, 50);
    assert_eq!(stats.lines, 500);
    assert_eq!(stats.failed, 0);

    server.shutdown().unwrap();
}

#[test]
fn test_invalid_utf8_drops_only_that_connection() {
    let server = start(local_config());
    let mut bad = Client::connect(server.local_addr());
    let mut good = Client::connect(server.local_addr());

    assert_eq!(bad.request("fine"), "FINE\n");
    bad.send_raw(b"\xc3\x28\n");
    assert!(bad.read_to_end().unwrap().is_empty());

    assert_eq!(good.request("unaffected"), "UNAFFECTED\n");
    assert!(wait_until(|| server.stats().failed == 1));

    drop(good);
    server.shutdown().unwrap();
}

#[test]
fn test_lossy_encoding_and_lower_transform() {
    let server = start(Config {
        transform: TransformKind::Lower,
        encoding: EncodingPolicy::Lossy,
        ..local_config()
    });
    let mut client = Client::connect(server.local_addr());

    client.send_raw(b"ABC\xffDEF\n");
    assert_eq!(client.recv(), "abc\u{FFFD}def\n");

    drop(client);
    server.shutdown().unwrap();
}

#[test]
fn test_connection_cap_rejects_extra_clients() {
    let server = start(Config {
        max_connections: Some(1),
        ..local_config()
    });
    let addr = server.local_addr();

    let mut first = Client::connect(addr);
    assert_eq!(first.request("first"), "FIRST\n");

    let mut second = Client::connect(addr);
    // Closed at admission: EOF or a reset, never a response.
    match second.read_to_end() {
        Ok(bytes) => assert!(bytes.is_empty()),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
    }
    assert!(wait_until(|| server.stats().rejected == 1));

    drop(first);
    assert!(wait_until(|| server.active_sessions() == 0));

    let mut third = Client::connect(addr);
    assert_eq!(third.request("third"), "THIRD\n");

    drop(third);
    server.shutdown().unwrap();
}

#[test]
fn test_shutdown_refuses_new_connections_and_detaches_sessions() {
    let server = start(local_config());
    let addr = server.local_addr();

    let mut established = Client::connect(addr);
    assert_eq!(established.request("before"), "BEFORE\n");

    let handle = server.shutdown_handle();
    server.shutdown().unwrap();
    assert_eq!(handle.state(), ServerState::Stopped);

    assert!(TcpStream::connect(addr).is_err());

    // Detached sessions keep serving until their peers leave.
    assert_eq!(established.request("after"), "AFTER\n");
}

#[test]
fn test_drain_waits_for_sessions() {
    let server = start(Config {
        shutdown: ShutdownPolicy::Drain,
        drain_timeout: Duration::from_secs(10),
        ..local_config()
    });
    let addr = server.local_addr();
    let lifecycle = server.shutdown_handle();

    let mut established = Client::connect(addr);
    assert_eq!(established.request("one"), "ONE\n");

    let shutdown = thread::spawn(move || server.shutdown());

    assert!(wait_until(|| lifecycle.state() == ServerState::ShuttingDown));
    assert!(wait_until(|| TcpStream::connect(addr).is_err()));
    assert_eq!(established.request("two"), "TWO\n");
    assert!(!shutdown.is_finished());

    drop(established);
    shutdown.join().unwrap().unwrap();
    assert_eq!(lifecycle.state(), ServerState::Stopped);
}

#[test]
fn test_abort_closes_sessions() {
    let server = start(Config {
        shutdown: ShutdownPolicy::Abort,
        drain_timeout: Duration::from_secs(5),
        ..local_config()
    });
    let addr = server.local_addr();

    let mut established = Client::connect(addr);
    assert_eq!(established.request("one"), "ONE\n");
    assert_eq!(server.active_sessions(), 1);

    server.shutdown().unwrap();

    assert_eq!(established.recv(), "");
    assert!(TcpStream::connect(addr).is_err());
}
