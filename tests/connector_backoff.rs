//! Connector backoff scenario (spec.md §8 scenario 5): connecting to a
//! closed port retries with exponential backoff until a listener appears.

mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_net::connector::Connector;
use reactor_net::inet_address::InetAddress;

#[test]
fn connector_retries_with_backoff_until_a_listener_appears() {
    common::init_logging();

    let connected = Arc::new(AtomicBool::new(false));
    let connected_cb = connected.clone();
    let start = Instant::now();

    let _guard = common::spawn_loop("connector-backoff-test", move |event_loop| {
        let addr = InetAddress::with_ip_port("127.0.0.1", 18083, false).unwrap();
        let connector = Connector::new(event_loop.clone(), addr);
        connector.set_new_connection_callback(Box::new(move |_socket| {
            connected_cb.store(true, Ordering::SeqCst);
        }));
        connector.start();
        connector
    });

    // Nothing listens on 18083 yet: the first attempt fails immediately with
    // ECONNREFUSED. Only after the default 500ms initial backoff (and
    // possibly a second, now-1s, retry) does a listener show up.
    let listener_thread = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(700));
        let listener = TcpListener::bind("127.0.0.1:18083").expect("bind backoff listener");
        // Keep the listener alive until the connect attempt lands.
        std::thread::sleep(Duration::from_secs(3));
        drop(listener);
    });

    let deadline = Instant::now() + Duration::from_secs(8);
    while !connected.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let elapsed = start.elapsed();

    assert!(connected.load(Ordering::SeqCst), "connector never succeeded after the listener came up");
    assert!(
        elapsed >= Duration::from_millis(450),
        "connected suspiciously fast ({elapsed:?}); backoff retry does not appear to have happened"
    );

    listener_thread.join().unwrap();
}
