//! spec.md §8 boundary behaviors: a zero-length `send()` is a safe no-op,
//! and `send()` called from a thread other than the connection's owning
//! loop thread still delivers the data (by hopping through `run_in_loop`
//! rather than writing directly).

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::inet_address::InetAddress;
use reactor_net::tcp_connection::TcpConnection;
use reactor_net::tcp_server::{ReusePort, TcpServer};

#[test]
fn zero_length_send_is_a_no_op_and_does_not_disturb_later_sends() {
    common::init_logging();

    let _guard = common::spawn_loop("boundary-send-zero", |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18087, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "zero-send", ReusePort::No).unwrap();
        server.set_connection_callback(Arc::new(|conn| {
            if conn.connected() {
                conn.send(&[]);
                conn.send(b"after empty send");
            }
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:18087").expect("connect to zero-send server");
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read after zero-length send");
    assert_eq!(&buf[..n], b"after empty send");
}

#[test]
fn send_from_a_non_loop_thread_still_delivers_the_data() {
    common::init_logging();

    let (conn_tx, conn_rx) = mpsc::channel::<Arc<TcpConnection>>();

    let _guard = common::spawn_loop("boundary-send-cross-thread", move |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18088, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "cross-thread-send", ReusePort::No).unwrap();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let _ = conn_tx.send(conn.clone());
            }
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:18088").expect("connect to cross-thread-send server");

    let conn = conn_rx.recv_timeout(Duration::from_secs(2)).expect("connection callback never ran");

    // The test thread is neither the loop thread nor the thread that
    // constructed `conn`; `send()` must still hop via `run_in_loop`.
    conn.send(b"sent from outside the loop");

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read cross-thread send");
    assert_eq!(&buf[..n], b"sent from outside the loop");
}
