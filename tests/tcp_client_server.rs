//! End-to-end round trip using this crate's own `TcpClient` against its own
//! `TcpServer`, exercising the Connector-backed client path alongside the
//! server path already covered by `echo.rs`'s std-library client.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::inet_address::InetAddress;
use reactor_net::tcp_client::TcpClient;
use reactor_net::tcp_server::{ReusePort, TcpServer};

#[test]
fn tcp_client_round_trips_through_tcp_server() {
    common::init_logging();

    let _server_guard = common::spawn_loop("client-server-test-server", |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18085, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "cs-echo", ReusePort::No).unwrap();
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });
    std::thread::sleep(Duration::from_millis(100));

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    let got_reply = Arc::new(AtomicBool::new(false));
    let got_reply_cb = got_reply.clone();
    let connected = Arc::new(AtomicBool::new(false));
    let connected_cb = connected.clone();

    let _client_guard = common::spawn_loop("client-server-test-client", move |event_loop| {
        let client_addr = InetAddress::with_ip_port("127.0.0.1", 18085, false).unwrap();
        let client = TcpClient::new(event_loop.clone(), client_addr, "cs-client");

        client.set_message_callback(Arc::new(move |_conn, buf, _time| {
            received_cb.lock().unwrap().extend_from_slice(buf.peek());
            buf.retrieve_all();
            got_reply_cb.store(true, Ordering::SeqCst);
        }));
        client.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn.send(b"via tcp client");
                connected_cb.store(true, Ordering::SeqCst);
            }
        }));
        client.connect();
        client
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !got_reply.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(connected.load(Ordering::SeqCst), "client never connected");
    assert_eq!(received.lock().unwrap().as_slice(), b"via tcp client");
}
