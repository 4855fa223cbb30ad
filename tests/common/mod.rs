use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

use reactor_net::event_loop::EventLoop;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Runs an `EventLoop` on a dedicated thread. `body` builds whatever
/// loop-owned objects the test needs (e.g. a `TcpServer`) *on that same
/// thread*, since every loop-owned object here is thread-confined from the
/// moment it's constructed; the returned value is kept alive on the loop's
/// stack across `EventLoop::run()` and only dropped once the loop quits —
/// again on the same thread, matching the original's convention of
/// constructing and destructing loop-bound objects from whichever thread
/// drives that loop.
pub struct LoopGuard {
    pub event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn spawn_loop<T, F>(name: &str, body: F) -> LoopGuard
where
    T: Send + 'static,
    F: FnOnce(Arc<EventLoop>) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).expect("send event loop back to test thread");
            let owned = body(event_loop.clone());
            event_loop.run();
            drop(owned);
        })
        .expect("spawn event loop thread");
    let event_loop = rx.recv().expect("receive event loop from spawned thread");
    LoopGuard { event_loop, handle: Some(handle) }
}
