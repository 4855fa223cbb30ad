//! Thread-confined interior mutability.
//!
//! Every reactor object in this crate (`Channel`, `EventLoop`'s `Poller` and
//! `TimerQueue`, `TcpConnection`, `Acceptor`, `Connector`) is mutated
//! exclusively by the single OS thread that owns its `EventLoop`, but is
//! handed out as a `Arc<...>` so it can be referenced from closures posted
//! across threads (`EventLoop::run_in_loop`/`queue_in_loop`). `LoopAffine<T>`
//! is the one place that bridges those two requirements: it stores the
//! owning thread's id alongside the value and panics if anything ever
//! touches the value from a different thread, exactly mirroring the
//! `assertInLoopThread` check the original performs before every mutation.

use std::cell::UnsafeCell;
use std::fmt;
use std::thread::{self, ThreadId};

pub struct LoopAffine<T> {
    owner: ThreadId,
    inner: UnsafeCell<T>,
}

// SAFETY: `inner` is only ever read or written through `with`/`with_ref`,
// both of which call `assert_owner` first. A `LoopAffine<T>` can therefore
// be shared across threads (so it can live inside an `Arc` captured by
// cross-thread closures) as long as every *access* still happens on the
// owning thread, which is the invariant this type exists to enforce.
unsafe impl<T> Sync for LoopAffine<T> {}

impl<T> LoopAffine<T> {
    /// Creates a new cell owned by the calling thread.
    pub fn new(value: T) -> Self {
        LoopAffine {
            owner: thread::current().id(),
            inner: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    #[track_caller]
    fn assert_owner(&self) {
        if !self.is_owned_by_current_thread() {
            panic!(
                "LoopAffine accessed from non-owning thread (owner = {:?}, caller = {:?})",
                self.owner,
                thread::current().id()
            );
        }
    }

    /// Runs `f` with mutable access to the wrapped value. Panics if called
    /// from any thread other than the owner.
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.assert_owner();
        // SAFETY: assert_owner just proved we are on the single thread that
        // is ever allowed to touch `inner`, so this is a unique borrow.
        let value = unsafe { &mut *self.inner.get() };
        f(value)
    }

    /// Runs `f` with shared access to the wrapped value. Panics if called
    /// from any thread other than the owner.
    #[track_caller]
    pub fn with_ref<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.assert_owner();
        let value = unsafe { &*self.inner.get() };
        f(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for LoopAffine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopAffine").field("owner", &self.owner).finish_non_exhaustive()
    }
}
