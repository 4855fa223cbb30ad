//! Readiness-list variant, grounded on
//! `original_source/src/net/src/EPollPoller.cc`.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelIndex};
use crate::config::Config;
use crate::sys::epoll::{self, Epoll, Events};

pub struct EpollPoller {
    epoll: Epoll,
    events: Events,
    channels: BTreeMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new(config: &Config) -> std::io::Result<EpollPoller> {
        Ok(EpollPoller {
            epoll: Epoll::new()?,
            events: Events::with_capacity(config.initial_event_list_size),
            channels: BTreeMap::new(),
        })
    }

    pub fn poll(&mut self, timeout: Duration) -> std::io::Result<(Instant, Vec<Arc<Channel>>)> {
        let n = match self.epoll.wait(&mut self.events, Some(timeout)) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
            Err(e) => {
                log::error!("EpollPoller::poll epoll_wait failed: {e}");
                0
            }
        };
        let now = Instant::now();

        let mut active = Vec::with_capacity(n);
        for (fd, revents) in self.events.iter() {
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(revents);
                active.push(channel.clone());
            }
        }

        if n == self.events.capacity() {
            let new_cap = self.events.capacity() * 2;
            log::debug!("EpollPoller growing event list to {new_cap}");
            self.events = Events::with_capacity(new_cap);
        }

        Ok((now, active))
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let events = translate_to_epoll(channel.events());
        match channel.index() {
            ChannelIndex::Unset | ChannelIndex::New | ChannelIndex::Deleted => {
                let index = channel.index();
                if index != ChannelIndex::Deleted {
                    self.channels.insert(fd, channel.clone());
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_index(ChannelIndex::Added);
                if let Err(e) = self.epoll.add(fd, events) {
                    log::error!("EpollPoller::update_channel add fd={fd} failed: {e}");
                }
            }
            ChannelIndex::Added => {
                if channel.is_none_event() {
                    if let Err(e) = self.epoll.delete(fd) {
                        log::error!("EpollPoller::update_channel delete fd={fd} failed: {e}");
                    }
                    channel.set_index(ChannelIndex::Deleted);
                } else if let Err(e) = self.epoll.modify(fd, events) {
                    log::error!("EpollPoller::update_channel modify fd={fd} failed: {e}");
                }
            }
            ChannelIndex::PollSlot(_) => {
                unreachable!("channel bound to the poll() variant's slot scheme")
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(matches!(index, ChannelIndex::Added | ChannelIndex::Deleted));
        self.channels.remove(&fd);
        if index == ChannelIndex::Added {
            if let Err(e) = self.epoll.delete(fd) {
                log::error!("EpollPoller::remove_channel delete fd={fd} failed: {e}");
            }
        }
        channel.set_index(ChannelIndex::New);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels.get(&channel.fd()).map_or(false, |c| Arc::ptr_eq(c, channel))
    }
}

fn translate_to_epoll(events: i32) -> i32 {
    // poll(2) and epoll(7) bit values coincide on Linux for the bits this
    // crate uses (POLLIN==EPOLLIN, POLLOUT==EPOLLOUT, ...), so `Channel`'s
    // mask is passed straight through; this helper exists so a future
    // platform with differing values has a single place to translate.
    let _ = epoll::EPOLLIN;
    events
}
