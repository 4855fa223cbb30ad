//! One event loop per thread: owns a `Poller`, a `TimerQueue`, and the
//! cross-thread pending-functor queue. Grounded on
//! `original_source/src/net/src/EventLoop.cc`.
//!
//! The original discovers "the loop for this thread" through thread-local
//! storage (`t_loopInThisThread`); this port threads an explicit `Arc<EventLoop>`
//! through every API instead (REDESIGN FLAGS) and checks ownership by
//! comparing `ThreadId`s, so no thread-local slot is needed at all.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;

use crate::callbacks::Functor;
use crate::channel::Channel;
use crate::config::Config;
use crate::poller::Poller;
use crate::sys::eventfd::EventFd;
use crate::timer::{TimerCallback, TimerId};
use crate::timer_queue::TimerQueue;

pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_functors: AtomicBool,
    iteration: AtomicU64,
    config: Config,
    poller: crate::affinity::LoopAffine<Poller>,
    timer_queue: Arc<TimerQueue>,
    wakeup_fd: EventFd,
    wakeup_channel: Arc<Channel>,
    pending_functors: ConcurrentQueue<Functor>,
}

impl EventLoop {
    /// Builds a loop owned by the calling thread, using `Config::from_env`.
    pub fn new() -> Arc<EventLoop> {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Arc<EventLoop> {
        let wakeup_fd = EventFd::new(0)
            .unwrap_or_else(|e| panic!("EventLoop: failed to create wakeup eventfd: {e}"));
        let poller = Poller::new(&config)
            .unwrap_or_else(|e| panic!("EventLoop: failed to create poller: {e}"));
        let wakeup_raw_fd = wakeup_fd.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_raw_fd);
            let timer_queue = TimerQueue::new(weak.clone())
                .unwrap_or_else(|e| panic!("EventLoop: failed to create timerfd: {e}"));
            EventLoop {
                thread_id: thread::current().id(),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending_functors: AtomicBool::new(false),
                iteration: AtomicU64::new(0),
                config,
                poller: crate::affinity::LoopAffine::new(poller),
                timer_queue,
                wakeup_fd,
                wakeup_channel,
                pending_functors: ConcurrentQueue::unbounded(),
            }
        });

        let weak_self = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(Box::new(move |_receive_time| {
            if let Some(loop_) = weak_self.upgrade() {
                loop_.handle_wakeup_read();
            }
        }));
        event_loop.wakeup_channel.enable_reading();

        event_loop
    }

    /// Runs the reactor loop on the calling thread until `quit` is called.
    /// Panics if called from a thread other than the one that constructed
    /// this loop, or if called re-entrantly.
    pub fn run(self: &Arc<Self>) {
        self.assert_in_loop_thread();
        assert!(
            !self.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called while already looping"
        );
        self.quit.store(false, Ordering::SeqCst);
        log::trace!("EventLoop {:?} start looping", self.thread_id);

        while !self.quit.load(Ordering::SeqCst) {
            let (_poll_return_time, active_channels) = match self
                .poller
                .with(|p| p.poll(self.config.max_poll_timeout))
            {
                Ok(result) => result,
                Err(e) => {
                    log::error!("EventLoop::run poll failed: {e}");
                    (Instant::now(), Vec::new())
                }
            };

            self.iteration.fetch_add(1, Ordering::Relaxed);
            self.event_handling.store(true, Ordering::SeqCst);
            for channel in &active_channels {
                channel.handle_event(_poll_return_time);
            }
            self.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_functors();
        }

        log::trace!("EventLoop {:?} stop looping", self.thread_id);
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Requests the loop stop at the start of its next iteration. Safe from
    /// any thread; wakes the loop if called from elsewhere so it doesn't
    /// have to wait out a full poll timeout.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            if let Err(e) = self.wakeup() {
                log::error!("EventLoop::quit wakeup failed: {e}");
            }
        }
    }

    /// Runs `f` immediately if called from the loop's own thread, otherwise
    /// queues it to run on the next iteration.
    pub fn run_in_loop(&self, f: Functor) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always queues `f`, even from the loop's own thread (it still runs
    /// after the current callback, never reentrantly from inside it).
    pub fn queue_in_loop(&self, f: Functor) {
        if self.pending_functors.push(f).is_err() {
            log::error!("EventLoop::queue_in_loop: pending functor queue is closed");
            return;
        }
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::SeqCst) {
            if let Err(e) = self.wakeup() {
                log::error!("EventLoop::queue_in_loop wakeup failed: {e}");
            }
        }
    }

    pub fn wakeup(&self) -> std::io::Result<()> {
        self.wakeup_fd.write(1)
    }

    fn handle_wakeup_read(&self) {
        if let Err(e) = self.wakeup_fd.read() {
            log::error!("EventLoop::handle_wakeup_read eventfd read failed: {e}");
        }
    }

    /// Drains the pending queue into a local `Vec` before running anything,
    /// so a functor that queues another functor doesn't grow the loop
    /// unboundedly and so none of this runs while holding a lock (there
    /// isn't one: draining a lock-free queue stands in for
    /// "swap the pending list under lock, then run without it").
    fn do_pending_functors(&self) {
        self.calling_pending_functors.store(true, Ordering::SeqCst);

        let mut functors = Vec::new();
        while let Ok(f) = self.pending_functors.pop() {
            functors.push(f);
        }
        for f in functors {
            f();
        }

        self.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.with(|p| p.update_channel(channel));
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.with(|p| p.remove_channel(channel));
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.with_ref(|p| p.has_channel(channel))
    }

    /// Schedules `cb` to run once at `when`.
    pub fn run_at(self: &Arc<Self>, when: Instant, cb: TimerCallback) -> TimerId {
        self.timer_queue.add_timer(cb, when, Duration::ZERO)
    }

    /// Schedules `cb` to run once after `delay`.
    pub fn run_after(self: &Arc<Self>, delay: Duration, cb: TimerCallback) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Schedules `cb` to run every `interval`, starting one `interval` from
    /// now.
    pub fn run_every(self: &Arc<Self>, interval: Duration, cb: TimerCallback) -> TimerId {
        self.timer_queue.add_timer(cb, Instant::now() + interval, interval)
    }

    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        self.timer_queue.cancel(id);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    #[track_caller]
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop accessed from non-owning thread (owner = {:?}, caller = {:?})",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub fn is_event_handling(&self) -> bool {
        self.event_handling.load(Ordering::SeqCst)
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let loop_ = EventLoop::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        loop_.run_in_loop(Box::new(move || *ran2.lock().unwrap() = true));
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn queue_in_loop_from_another_thread_wakes_the_loop() {
        let loop_ = EventLoop::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();

        let loop_for_thread = loop_.clone();
        let handle = thread::spawn(move || {
            loop_for_thread.queue_in_loop(Box::new(move || {
                *ran2.lock().unwrap() = true;
            }));
            loop_for_thread.quit();
        });

        loop_.run();
        handle.join().unwrap();

        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn quit_stops_a_running_loop() {
        let loop_ = EventLoop::new();
        let loop_thread = loop_.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            loop_thread.quit();
        });
        loop_.run();
        handle.join().unwrap();
    }

    #[test]
    fn update_channel_off_thread_panics() {
        let loop_ = EventLoop::new();
        let raw_fd = loop_.wakeup_fd.as_raw_fd();
        let channel = Channel::new(Arc::downgrade(&loop_), raw_fd);
        let loop_for_thread = loop_.clone();
        let result = thread::spawn(move || {
            loop_for_thread.update_channel(&channel);
        })
        .join();

        let err = result.expect_err("update_channel off-thread should panic");
        let message = err
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| err.downcast_ref::<&str>().copied())
            .unwrap_or("");
        assert!(message.contains("non-owning thread"), "unexpected panic message: {message}");
    }
}
