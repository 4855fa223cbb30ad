//! Kernel-timerfd-backed ordered set of expirations, grounded on
//! `original_source/src/net/src/TimerQueue.cc`.
//!
//! The original keys two parallel `std::set`s by `(Timestamp, Timer*)` and
//! `(Timer*, sequence)` so a cancelled-then-reused pointer can't be confused
//! with a live timer. Since `TimerId` here is already a globally unique
//! sequence number (see `timer.rs`), one `BTreeMap<u64, TimerRecord>` (owns
//! the callback) plus one `BTreeSet<(Instant, u64)>` (for cheap
//! earliest-expiration / range-expired lookups) cover the same ground.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::affinity::LoopAffine;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::timerfd::{self, TimerFd};
use crate::timer::{TimerCallback, TimerId};

struct TimerRecord {
    callback: TimerCallback,
    expiration: Instant,
    interval: Duration,
    repeat: bool,
}

struct ExpiredTimer {
    id: u64,
    record: TimerRecord,
}

struct TimerQueueState {
    timers: BTreeMap<u64, TimerRecord>,
    ordered: BTreeSet<(Instant, u64)>,
    calling_expired: bool,
    canceling: HashSet<u64>,
}

pub struct TimerQueue {
    event_loop: Weak<EventLoop>,
    timerfd: TimerFd,
    channel: Arc<Channel>,
    next_sequence: AtomicU64,
    state: LoopAffine<TimerQueueState>,
}

impl TimerQueue {
    pub fn new(event_loop: Weak<EventLoop>) -> std::io::Result<Arc<TimerQueue>> {
        let timerfd = TimerFd::new()?;
        let fd = timerfd.as_raw_fd();
        let channel = Channel::new(event_loop.clone(), fd);

        let queue = Arc::new(TimerQueue {
            event_loop,
            timerfd,
            channel: channel.clone(),
            next_sequence: AtomicU64::new(0),
            state: LoopAffine::new(TimerQueueState {
                timers: BTreeMap::new(),
                ordered: BTreeSet::new(),
                calling_expired: false,
                canceling: HashSet::new(),
            }),
        });

        let weak_queue = Arc::downgrade(&queue);
        channel.set_read_callback(Box::new(move |_receive_time| {
            if let Some(queue) = weak_queue.upgrade() {
                queue.handle_read();
            }
        }));
        channel.enable_reading();

        Ok(queue)
    }

    /// Schedules `cb` to run at `when`, repeating every `interval` if
    /// non-zero. Safe to call from any thread (spec.md §4.4).
    pub fn add_timer(self: &Arc<Self>, cb: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        if let Some(loop_) = self.event_loop.upgrade() {
            loop_.run_in_loop(Box::new(move || this.add_timer_in_loop(seq, cb, when, interval)));
        }
        TimerId(seq)
    }

    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        let this = self.clone();
        if let Some(loop_) = self.event_loop.upgrade() {
            loop_.run_in_loop(Box::new(move || this.cancel_in_loop(id)));
        }
    }

    fn add_timer_in_loop(&self, seq: u64, cb: TimerCallback, when: Instant, interval: Duration) {
        self.assert_in_loop();
        let repeat = interval > Duration::ZERO;
        let earliest_changed = self.state.with(|s| {
            let earliest_changed = s.ordered.iter().next().map_or(true, |&(t, _)| when < t);
            s.timers.insert(seq, TimerRecord { callback: cb, expiration: when, interval, repeat });
            s.ordered.insert((when, seq));
            earliest_changed
        });
        if earliest_changed {
            self.rearm(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop();
        let found = self.state.with(|s| {
            if let Some(record) = s.timers.remove(&id.0) {
                s.ordered.remove(&(record.expiration, id.0));
                true
            } else {
                false
            }
        });
        if !found {
            // Not present: either already fired, or mid-dispatch right now.
            // In the latter case record it so `reset` skips re-arming a
            // repeating timer that cancelled itself inside its own callback.
            self.state.with(|s| {
                if s.calling_expired {
                    s.canceling.insert(id.0);
                }
            });
        }
    }

    fn handle_read(self: &Arc<Self>) {
        self.assert_in_loop();
        if let Err(e) = self.timerfd.read() {
            log::error!("TimerQueue::handle_read timerfd read failed: {e}");
        }
        let now = Instant::now();
        log::trace!("TimerQueue::handle_read at {now:?}");

        let mut expired = self.get_expired(now);

        self.state.with(|s| {
            s.calling_expired = true;
            s.canceling.clear();
        });

        for e in &mut expired {
            (e.record.callback)();
        }

        self.state.with(|s| s.calling_expired = false);

        self.reset(expired, now);
    }

    fn get_expired(&self, now: Instant) -> Vec<ExpiredTimer> {
        self.state.with(|s| {
            let sentry = (now, u64::MAX);
            let due: Vec<(Instant, u64)> = s.ordered.range(..=sentry).cloned().collect();
            let mut expired = Vec::with_capacity(due.len());
            for key in due {
                s.ordered.remove(&key);
                if let Some(record) = s.timers.remove(&key.1) {
                    expired.push(ExpiredTimer { id: key.1, record });
                }
            }
            expired
        })
    }

    fn reset(&self, expired: Vec<ExpiredTimer>, now: Instant) {
        for mut e in expired {
            let canceled = self.state.with_ref(|s| s.canceling.contains(&e.id));
            if e.record.repeat && !canceled {
                e.record.expiration = now + e.record.interval;
                let expiration = e.record.expiration;
                self.state.with(|s| {
                    s.ordered.insert((expiration, e.id));
                    s.timers.insert(e.id, e.record);
                });
            }
        }

        let next = self.state.with_ref(|s| s.ordered.iter().next().map(|&(t, _)| t));
        if let Some(next_expiration) = next {
            self.rearm(next_expiration);
        }
    }

    fn rearm(&self, expiration: Instant) {
        let now = Instant::now();
        let delay = if expiration > now { expiration - now } else { Duration::ZERO };
        if let Err(e) = self.timerfd.set(timerfd::clamp_min(delay)) {
            log::error!("TimerQueue::rearm timerfd_settime failed: {e}");
        }
    }

    fn assert_in_loop(&self) {
        if let Some(loop_) = self.event_loop.upgrade() {
            loop_.assert_in_loop_thread();
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::Mutex;

    fn new_loop() -> Arc<EventLoop> {
        EventLoop::new()
    }

    #[test]
    fn cancel_already_fired_one_shot_is_a_no_op() {
        let loop_ = new_loop();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();
        let id = loop_.run_after(Duration::from_millis(5), Box::new(move || {
            *fired2.lock().unwrap() = true;
        }));

        let loop_thread = loop_.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            loop_thread.quit();
        });
        loop_.run();

        assert!(*fired.lock().unwrap());
        // Cancelling after it already fired must not panic or double-free.
        loop_.cancel(id);
    }

    #[test]
    fn timers_fire_in_expiration_order_regardless_of_scheduling_order() {
        let loop_ = new_loop();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Scheduled C, A, B but due to fire A, B, C.
        let order_c = order.clone();
        loop_.run_after(Duration::from_millis(30), Box::new(move || order_c.lock().unwrap().push('C')));
        let order_a = order.clone();
        loop_.run_after(Duration::from_millis(10), Box::new(move || order_a.lock().unwrap().push('A')));
        let order_b = order.clone();
        loop_.run_after(Duration::from_millis(20), Box::new(move || order_b.lock().unwrap().push('B')));

        let loop_thread = loop_.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            loop_thread.quit();
        });
        loop_.run();

        assert_eq!(*order.lock().unwrap(), vec!['A', 'B', 'C']);
    }

    #[test]
    fn a_repeating_timer_can_cancel_itself_from_inside_its_own_callback() {
        let loop_ = new_loop();
        let fire_count = Arc::new(AtomicU64::new(0));
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let fire_count2 = fire_count.clone();
        let id_slot2 = id_slot.clone();
        let loop_for_cb = loop_.clone();
        let id = loop_.run_every(Duration::from_millis(10), Box::new(move || {
            let n = fire_count2.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                if let Some(id) = *id_slot2.lock().unwrap() {
                    loop_for_cb.cancel(id);
                }
            }
        }));
        *id_slot.lock().unwrap() = Some(id);

        let loop_thread = loop_.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            loop_thread.quit();
        });
        loop_.run();

        // Must have fired exactly twice: the repeat scheduled by the second
        // firing's `reset` must have been suppressed by the in-callback cancel.
        assert_eq!(fire_count.load(Ordering::SeqCst), 2);
    }
}
