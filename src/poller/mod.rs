//! Readiness multiplexer, collapsed to a sum type over the two variants
//! (REDESIGN FLAGS: "Virtual-dispatch Poller ... the loop holds the sum
//! type, not a dynamic reference"), selected once at `EventLoop`
//! construction from `Config::poller` (spec.md §4.2/§6).

mod epoll;
mod poll;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::config::{Config, PollerKind};

pub use epoll::EpollPoller;
pub use poll::PollPoller;

pub enum Poller {
    Epoll(EpollPoller),
    Poll(PollPoller),
}

impl Poller {
    pub fn new(config: &Config) -> std::io::Result<Poller> {
        Ok(match config.poller {
            PollerKind::Epoll => Poller::Epoll(EpollPoller::new(config)?),
            PollerKind::Poll => Poller::Poll(PollPoller::new(config)),
        })
    }

    /// Blocks up to `timeout`, returning the poll-return timestamp and the
    /// channels that became active.
    pub fn poll(&mut self, timeout: Duration) -> std::io::Result<(Instant, Vec<Arc<Channel>>)> {
        match self {
            Poller::Epoll(p) => p.poll(timeout),
            Poller::Poll(p) => p.poll(timeout),
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Epoll(p) => p.update_channel(channel),
            Poller::Poll(p) => p.update_channel(channel),
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Epoll(p) => p.remove_channel(channel),
            Poller::Poll(p) => p.remove_channel(channel),
        }
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        match self {
            Poller::Epoll(p) => p.has_channel(channel),
            Poller::Poll(p) => p.has_channel(channel),
        }
    }
}
