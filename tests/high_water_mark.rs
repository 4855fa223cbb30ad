//! High-water-mark scenario (spec.md §8 scenario 4): once the output buffer
//! backlog for a connection crosses a configured threshold, the
//! high-water-mark callback must fire exactly once per crossing.

mod common;

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_net::event_loop::EventLoop;
use reactor_net::inet_address::InetAddress;
use reactor_net::tcp_server::{ReusePort, TcpServer};

#[test]
fn high_water_mark_callback_fires_once_backlog_crosses_the_threshold() {
    common::init_logging();

    let fired = Arc::new(AtomicBool::new(false));
    let fire_count = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    let fire_count_cb = fire_count.clone();

    let _guard = common::spawn_loop("hwm-test", move |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18082, false).unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "hwm", ReusePort::No).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                return;
            }
            let fired_hwm = fired_cb.clone();
            let fire_count_hwm = fire_count_cb.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, _len| {
                    fired_hwm.store(true, Ordering::SeqCst);
                    fire_count_hwm.fetch_add(1, Ordering::SeqCst);
                }),
                1024,
            );
            // Push far more than the 1024-byte mark in one call; the client
            // below never reads, so TCP flow control forces this into the
            // connection's own output buffer.
            let payload = vec![b'x'; 16 * 1024 * 1024];
            conn.send(&payload);
        }));
        server.start(None::<fn(&Arc<EventLoop>)>);
        server
    });

    std::thread::sleep(Duration::from_millis(100));

    let _stream = TcpStream::connect("127.0.0.1:18082").expect("connect to hwm server");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(fired.load(Ordering::SeqCst), "high water mark callback never fired");
    assert_eq!(fire_count.load(Ordering::SeqCst), 1, "callback must fire exactly once per crossing");
}
