//! Timer identity and callback types, grounded on
//! `original_source/src/net/include/{Timer,TimerId}.h`.
//!
//! The original identifies a timer by `(Timer*, sequence)` so cancellation
//! can tell a freed-and-reused pointer apart from the timer that requested
//! cancellation. A monotonically increasing `u64` sequence is already
//! globally unique on its own, so `TimerId` here is just that sequence —
//! no pointer half needed.

/// Returned by `EventLoop::run_at`/`run_after`/`run_every`, passed back to
/// `cancel`. Opaque; carries no meaning outside this crate's `TimerQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

/// A timer callback, queued across threads via `EventLoop::run_in_loop`
/// exactly like any other pending functor, hence the `Send` bound.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;
