//! Array-scan variant, grounded on
//! `original_source/src/net/src/PollPoller.cc`. Disabling a channel negates
//! its fd to `-(fd+1)` so the kernel ignores it without losing its slot;
//! removal swap-pops the slot and fixes up the swapped neighbour's index.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelIndex};
use crate::config::Config;

pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: BTreeMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new(config: &Config) -> PollPoller {
        PollPoller {
            pollfds: Vec::with_capacity(config.initial_event_list_size),
            channels: BTreeMap::new(),
        }
    }

    pub fn poll(&mut self, timeout: Duration) -> std::io::Result<(Instant, Vec<Arc<Channel>>)> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            let ret = unsafe {
                libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if ret >= 0 {
                break ret;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("PollPoller::poll failed: {err}");
            break 0;
        };
        let now = Instant::now();

        let mut active = Vec::new();
        if n > 0 {
            self.fill_active_channels(n as usize, &mut active);
        }
        Ok((now, active))
    }

    /// Scans the whole vector rather than early-exiting once `num_events`
    /// entries are found, preserving the original's (harmless) behavior per
    /// spec.md §9's documented Open Question.
    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        let mut remaining = num_events;
        for pfd in &self.pollfds {
            if pfd.revents > 0 {
                if remaining > 0 {
                    remaining -= 1;
                }
                let fd = if pfd.fd >= 0 { pfd.fd } else { -(pfd.fd) - 1 };
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(pfd.revents as i32);
                    active.push(channel.clone());
                }
            }
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let events = channel.events() as libc::c_short;

        match channel.index() {
            ChannelIndex::Unset | ChannelIndex::New => {
                debug_assert!(!self.channels.contains_key(&fd));
                self.pollfds.push(libc::pollfd { fd, events, revents: 0 });
                let idx = self.pollfds.len() - 1;
                channel.set_index(ChannelIndex::PollSlot(idx));
                self.channels.insert(fd, channel.clone());
            }
            ChannelIndex::PollSlot(idx) => {
                debug_assert!(self.channels.contains_key(&fd));
                debug_assert!(idx < self.pollfds.len());
                let pfd = &mut self.pollfds[idx];
                debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
                pfd.events = events;
                pfd.revents = 0;
                if channel.is_none_event() {
                    // Ignored by the kernel, slot retained for cheap re-enable.
                    pfd.fd = -fd - 1;
                } else {
                    pfd.fd = fd;
                }
            }
            ChannelIndex::Added | ChannelIndex::Deleted => {
                unreachable!("channel bound to the epoll() variant's index scheme")
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        let idx = match channel.index() {
            ChannelIndex::PollSlot(idx) => idx,
            other => unreachable!("remove_channel on channel with index {other:?}"),
        };

        self.channels.remove(&fd);

        let last = self.pollfds.len() - 1;
        if idx != last {
            self.pollfds.swap(idx, last);
            let moved = self.pollfds[idx];
            let moved_fd = if moved.fd >= 0 { moved.fd } else { -(moved.fd) - 1 };
            if let Some(moved_channel) = self.channels.get(&moved_fd) {
                moved_channel.set_index(ChannelIndex::PollSlot(idx));
            }
        }
        self.pollfds.pop();
        channel.set_index(ChannelIndex::New);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels.get(&channel.fd()).map_or(false, |c| Arc::ptr_eq(c, channel))
    }
}
