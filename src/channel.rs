//! Per-fd event mask and callback bundle, owned by exactly one loop.
//! Grounded on `original_source`'s `Channel` (referenced throughout
//! `EventLoop.h`/`Poller.h`/`EPollPoller.cc`/`TcpConnection.cc`, though the
//! class itself fell outside the filtered source pack) and on the event-bit
//! handling in `EPollPoller.cc`/`PollPoller.cc`.
//!
//! The interest/returned-events mask uses `poll(2)`'s bit values directly
//! (`POLLIN`/`POLLOUT`/`POLLPRI`/`POLLERR`/`POLLHUP`/`POLLRDHUP`) rather than
//! epoll's, because on Linux the two bit spaces are numerically identical —
//! the same convention `original_source`'s `Channel.cc` relies on
//! (`kReadEvent = POLLIN | POLLPRI`) — so both `Poller` variants read/write
//! this mask with no translation.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::affinity::LoopAffine;
use crate::event_loop::EventLoop;

pub const NONE: i32 = 0;
pub const READ: i32 = libc::POLLIN | libc::POLLPRI;
pub const WRITE: i32 = libc::POLLOUT;

/// Meaning is poller-specific (spec.md §3/§4.2, REDESIGN FLAGS' "tagged enum
/// per variant" in place of the original's overloaded sentinel integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelIndex {
    /// Readiness-list (epoll) variant: never added to the kernel set.
    New,
    /// Readiness-list variant: currently registered with the kernel.
    Added,
    /// Readiness-list variant: registered once, temporarily disabled.
    Deleted,
    /// Array-scan (poll) variant: slot in the `pollfd` vector.
    PollSlot(usize),
    /// Not yet assigned a slot by the array-scan variant.
    Unset,
}

// `Send`-bounded even though a callback only ever runs on the owning loop's
// thread: the structs that hold a `Channel` (`TcpConnection`, `Acceptor`,
// `Connector`, `TimerQueue`) are themselves captured by `Arc` inside
// `EventLoop::run_in_loop`/`queue_in_loop` functors, which requires every
// field transitively `Send` for the `Arc` itself to be `Send`.
pub type ReadCallback = Box<dyn FnMut(Instant) + Send>;
pub type EventCallback = Box<dyn FnMut() + Send>;

struct ChannelState {
    events: i32,
    revents: i32,
    index: ChannelIndex,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

pub struct Channel {
    fd: RawFd,
    // Weak, not Arc: `EventLoop` transitively owns every Channel it hosts
    // (directly via TimerQueue/wakeup, indirectly through Acceptor/
    // Connector/TcpConnection), so a strong back-reference would be a cycle
    // that never drops. The loop always outlives channels registered on it.
    event_loop: Weak<EventLoop>,
    state: LoopAffine<ChannelState>,
}

impl Channel {
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            event_loop,
            state: LoopAffine::new(ChannelState {
                events: NONE,
                revents: NONE,
                index: ChannelIndex::Unset,
                tie: None,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.upgrade()
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        self.state.with(|s| s.read_callback = Some(cb));
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.state.with(|s| s.write_callback = Some(cb));
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.state.with(|s| s.close_callback = Some(cb));
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.state.with(|s| s.error_callback = Some(cb));
    }

    /// Guards dispatch against use-after-free: `handle_event` promotes
    /// `owner` before running any callback, and skips entirely if promotion
    /// fails (spec.md §4.1, §9's self-weak-reference pattern).
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        self.state.with(|s| s.tie = Some(owner));
    }

    pub fn events(&self) -> i32 {
        self.state.with_ref(|s| s.events)
    }

    pub fn set_revents(&self, revents: i32) {
        self.state.with(|s| s.revents = revents);
    }

    pub fn index(&self) -> ChannelIndex {
        self.state.with_ref(|s| s.index)
    }

    pub fn set_index(&self, index: ChannelIndex) {
        self.state.with(|s| s.index = index);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == NONE
    }

    pub fn is_writing(&self) -> bool {
        self.events() & WRITE != 0
    }

    pub fn is_reading(&self) -> bool {
        self.events() & READ != 0
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.state.with(|s| s.events |= READ);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.state.with(|s| s.events &= !READ);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.state.with(|s| s.events |= WRITE);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.state.with(|s| s.events &= !WRITE);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.with(|s| s.events = NONE);
        self.update();
    }

    /// Pushes the current interest mask to the owning loop's Poller. A no-op
    /// if the loop has already been torn down.
    pub fn update(self: &Arc<Self>) {
        if let Some(loop_) = self.event_loop.upgrade() {
            loop_.update_channel(self);
        }
    }

    /// Deregisters from the owning loop's Poller. Must be called before the
    /// owner is dropped, with interest already disabled.
    pub fn remove(self: &Arc<Self>) {
        if let Some(loop_) = self.event_loop.upgrade() {
            loop_.remove_channel(self);
        }
    }

    /// Dispatches on `revents` in priority order: close, error, read, write.
    /// If tied, the tie is promoted first; a dead tie skips dispatch
    /// entirely (spec.md §4.1).
    pub fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let tie_alive = self.state.with_ref(|s| match &s.tie {
            Some(weak) => weak.upgrade().is_some(),
            None => true,
        });
        if !tie_alive {
            return;
        }

        let revents = self.state.with_ref(|s| s.revents);
        log::trace!("channel fd={} handle_event revents={:#x}", self.fd, revents);

        if revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0 {
            self.dispatch_close();
        }
        if revents & libc::POLLNVAL != 0 {
            log::warn!("channel fd={} POLLNVAL", self.fd);
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            self.dispatch_error();
        }
        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0 {
            self.dispatch_read(receive_time);
        }
        if revents & libc::POLLOUT != 0 {
            self.dispatch_write();
        }
    }

    fn dispatch_read(&self, receive_time: Instant) {
        let mut cb = self.state.with(|s| s.read_callback.take());
        if let Some(f) = cb.as_mut() {
            f(receive_time);
        }
        self.state.with(|s| {
            if s.read_callback.is_none() {
                s.read_callback = cb;
            }
        });
    }

    fn dispatch_write(&self) {
        let mut cb = self.state.with(|s| s.write_callback.take());
        if let Some(f) = cb.as_mut() {
            f();
        }
        self.state.with(|s| {
            if s.write_callback.is_none() {
                s.write_callback = cb;
            }
        });
    }

    fn dispatch_close(&self) {
        let mut cb = self.state.with(|s| s.close_callback.take());
        if let Some(f) = cb.as_mut() {
            f();
        }
        self.state.with(|s| {
            if s.close_callback.is_none() {
                s.close_callback = cb;
            }
        });
    }

    fn dispatch_error(&self) {
        let mut cb = self.state.with(|s| s.error_callback.take());
        if let Some(f) = cb.as_mut() {
            f();
        }
        self.state.with(|s| {
            if s.error_callback.is_none() {
                s.error_callback = cb;
            }
        });
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .field("index", &self.index())
            .finish()
    }
}
