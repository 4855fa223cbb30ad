//! Round-robin pool of `EventLoopThread`s, grounded on
//! `original_source/src/net/src/EventLoopThreadPool.cc`.
//!
//! `getLoopForHash` there indexes with `hashCode & loops_.size()` — a stray
//! bitwise-and against the vector's length rather than its length minus one,
//! so it's neither a valid mask nor the modulo the name promises; for any
//! pool size that isn't a power of two it can index out of bounds. Fixed
//! here to the modulo the method is actually documented to perform
//! (spec.md §9's documented Open Question).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: AtomicUsize,
    started: std::sync::atomic::AtomicBool,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::SeqCst);
    }

    pub fn start(&self, callback: Option<impl Fn(&Arc<EventLoop>) + Send + Sync + Clone + 'static>) {
        self.base_loop.assert_in_loop_thread();
        assert!(!self.started.swap(true, Ordering::SeqCst), "EventLoopThreadPool::start called twice");

        let num_threads = self.num_threads.load(Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();

        for i in 0..num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let cb = callback.clone();
            let init: Option<ThreadInitCallback> = cb.map(|cb| -> ThreadInitCallback { Box::new(move |l| cb(l)) });
            let thread = EventLoopThread::with_init_callback(thread_name, init);
            loops.push(thread.start_loop());
            threads.push(thread);
        }

        if num_threads == 0 {
            if let Some(cb) = callback {
                cb(&self.base_loop);
            }
        }
    }

    /// Returns the next loop in round-robin order, or the base loop if the
    /// pool has no threads.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::SeqCst), "EventLoopThreadPool::get_next_loop before start");

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % loops.len();
        loops[idx].clone()
    }

    /// Returns a loop deterministically selected by `hash_code`, or the base
    /// loop if the pool has no threads.
    pub fn get_loop_for_hash(&self, hash_code: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        loops[hash_code % loops.len()].clone()
    }

    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::SeqCst), "EventLoopThreadPool::get_all_loops before start");

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_loop_for_hash_never_indexes_out_of_bounds_for_non_power_of_two_pool() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base, "pool-");
        pool.set_thread_num(3);
        pool.start(None::<fn(&Arc<EventLoop>)>);

        for hash in 0..10 {
            let _ = pool.get_loop_for_hash(hash);
        }
    }

    #[test]
    fn get_next_loop_round_robins_across_threads() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base, "pool-");
        pool.set_thread_num(2);
        pool.start(None::<fn(&Arc<EventLoop>)>);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        assert!(Arc::ptr_eq(&first, &third));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn zero_threads_returns_the_base_loop() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base.clone(), "pool-");
        pool.start(None::<fn(&Arc<EventLoop>)>);
        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
    }
}
