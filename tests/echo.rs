//! End-to-end echo scenario (spec.md §8 scenario 1): a client writes bytes,
//! the server's message callback echoes them back unchanged.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::inet_address::InetAddress;
use reactor_net::tcp_server::{ReusePort, TcpServer};

#[test]
fn server_echoes_back_exactly_what_the_client_sent() {
    common::init_logging();

    let _guard = common::spawn_loop("echo-test", |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18080, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "echo", ReusePort::No).unwrap();
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:18080").expect("connect to echo server");
    stream.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read echoed bytes");
    assert_eq!(&buf[..n], b"hello reactor");
}

#[test]
fn server_handles_multiple_sequential_writes_on_one_connection() {
    common::init_logging();

    let _guard = common::spawn_loop("echo-test-2", |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18081, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "echo2", ReusePort::No).unwrap();
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:18081").expect("connect to echo server");
    for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        stream.write_all(chunk).unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).expect("read echoed bytes");
        assert_eq!(&buf[..n], chunk);
    }
}

/// spec.md §8 scenario 1 (close half): the client shutting down its write
/// side must propagate into the server-side connection's `connection_callback`
/// reporting disconnection, and into a subsequent `read()` on the client
/// observing EOF from the server's own close.
#[test]
fn client_shutdown_propagates_to_the_server_side_connection_closing() {
    common::init_logging();

    let disconnected = Arc::new(AtomicBool::new(false));
    let disconnected_cb = disconnected.clone();

    let _guard = common::spawn_loop("echo-test-close", move |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18086, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "echo-close", ReusePort::No).unwrap();
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                disconnected_cb.store(true, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:18086").expect("connect to echo server");
    stream.write_all(b"closing soon").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read echoed bytes");
    assert_eq!(&buf[..n], b"closing soon");

    stream.shutdown(std::net::Shutdown::Write).expect("shutdown write half");

    // The server half-closes in response; the client must observe EOF.
    let n = stream.read(&mut buf).expect("read after shutdown");
    assert_eq!(n, 0, "expected EOF once the server closes its side");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !disconnected.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(disconnected.load(Ordering::SeqCst), "server-side connection_callback never reported disconnection");
}
