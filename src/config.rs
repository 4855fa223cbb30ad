//! Process-wide configuration, assembled once and injected rather than read
//! ad hoc from globals (see DESIGN NOTES in SPEC_FULL.md on mutable global
//! state).

use std::env;
use std::time::Duration;

/// Which readiness multiplexer a `Poller` should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    /// epoll(7)-backed, readiness-list style. The default.
    Epoll,
    /// poll(2)-backed, level-triggered array-scan style.
    Poll,
}

/// The one recognized environment variable (spec.md §6): if set and
/// non-empty, selects the level-triggered `poll` variant.
pub const POLLER_ENV_VAR: &str = "REACTOR_NET_USE_POLL";

#[derive(Debug, Clone)]
pub struct Config {
    pub poller: PollerKind,
    /// Bound passed to the multiplexer's wait call when no timer is nearer.
    pub max_poll_timeout: Duration,
    /// Default high-water mark applied to new `TcpConnection`s.
    pub default_high_water_mark: usize,
    /// Initial Connector retry delay.
    pub connector_init_retry_delay: Duration,
    /// Ceiling on Connector retry delay.
    pub connector_max_retry_delay: Duration,
    /// Initial epoll/poll event-buffer capacity.
    pub initial_event_list_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poller: PollerKind::Epoll,
            max_poll_timeout: Duration::from_millis(10_000),
            default_high_water_mark: 64 * 1024 * 1024,
            connector_init_retry_delay: Duration::from_millis(500),
            connector_max_retry_delay: Duration::from_secs(30),
            initial_event_list_size: 16,
        }
    }
}

impl Config {
    /// Reads `REACTOR_NET_USE_POLL` and assembles the rest of the defaults.
    /// Called once by the first `EventLoop` constructed in a process; callers
    /// embedding this crate can also build a `Config` themselves and pass it
    /// explicitly to avoid any environment dependence.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(val) = env::var(POLLER_ENV_VAR) {
            if !val.is_empty() {
                config.poller = PollerKind::Poll;
            }
        }
        config
    }
}
