//! IPv6 round-trip scenario (spec.md §8 scenario 6): a server bound to an
//! IPv6 loopback address accepts a real IPv6 connection, echoes data back,
//! and reports a bracketed `ip:port` string for the peer address.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_net::event_loop::EventLoop;
use reactor_net::inet_address::InetAddress;
use reactor_net::tcp_server::{ReusePort, TcpServer};

#[test]
fn ipv6_connection_echoes_and_reports_a_bracketed_peer_address() {
    common::init_logging();

    let peer_ip_port: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let peer_ip_port_cb = peer_ip_port.clone();
    let connected = Arc::new(AtomicBool::new(false));
    let connected_cb = connected.clone();
    let bound = Arc::new(AtomicBool::new(false));
    let bound_cb = bound.clone();

    let _guard = common::spawn_loop("ipv6-test", move |event_loop| {
        let addr = InetAddress::new(18084, true, true);
        let server = match TcpServer::new(event_loop.clone(), addr, "ipv6echo", ReusePort::No) {
            Ok(server) => server,
            Err(_) => return None,
        };
        bound_cb.store(true, Ordering::SeqCst);

        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *peer_ip_port_cb.lock().unwrap() = Some(conn.peer_addr().to_ip_port());
                connected_cb.store(true, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        Some(server)
    });

    std::thread::sleep(Duration::from_millis(100));

    if !bound.load(Ordering::SeqCst) {
        eprintln!("skipping ipv6 test: bind to [::1]:18084 failed (no IPv6 support in this sandbox?)");
        return;
    }

    let mut stream = match TcpStream::connect("[::1]:18084") {
        Ok(s) => s,
        Err(e) => {
            eprintln!("skipping ipv6 test, connect failed: {e}");
            return;
        }
    };
    stream.write_all(b"ipv6 echo").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read echoed bytes");
    assert_eq!(&buf[..n], b"ipv6 echo");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !connected.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let reported = peer_ip_port.lock().unwrap().clone().expect("connection callback must have recorded the peer address");
    assert!(reported.starts_with('['), "IPv6 peer address must be bracketed, got {reported}");
}
