//! The epoll-backed multiplexer owned by each event loop.
//!
//! The poller mirrors the kernel's interest table: every descriptor present in
//! the kernel table has a matching entry in `channels` pointing at the live
//! [Channel], and interest-set changes are translated into the corresponding
//! `epoll_ctl` operations. The loop thread is the only caller.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use tracing::{error, trace};

use crate::error::Result;
use crate::reactor::channel::{Channel, ChannelRef, PollerState};
use crate::timestamp::Timestamp;

/// Initial capacity of the kernel event buffer; doubled whenever a wait fills
/// it completely. Never shrinks.
const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll: Epoll,
    events: Vec<EpollEvent>,
    channels: HashMap<RawFd, ChannelRef>,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Poller {
            epoll,
            events: vec![EpollEvent::empty(); INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    /// Block until readiness or `timeout`, stamping each ready channel with
    /// its observed event set and appending it to `active` in kernel order.
    ///
    /// A wait interrupted by a signal is not an error; any other failure is
    /// logged and yields an empty tick. Returns the wall-clock time the wait
    /// ended, which dispatch hands to every read callback.
    pub fn poll(&mut self, timeout: EpollTimeout, active: &mut Vec<ChannelRef>) -> Timestamp {
        let result = self.epoll.wait(&mut self.events, timeout);
        let now = Timestamp::now();

        match result {
            Ok(0) => {
                trace!("poll timed out with no events");
            }
            Ok(n) => {
                trace!(ready = n, registered = self.channels.len(), "poll returned");
                for event in &self.events[..n] {
                    let fd = event.data() as RawFd;
                    if let Some(ch) = self.channels.get(&fd) {
                        ch.borrow_mut().set_revents(event.events());
                        active.push(ch.clone());
                    }
                }
                if n == self.events.len() {
                    // The kernel filled the whole buffer; there may be more
                    // ready descriptors than we had room for.
                    self.events.resize(n * 2, EpollEvent::empty());
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                error!(error = %e, "epoll_wait failed");
            }
        }
        now
    }

    /// Reconcile a channel's interest mask with the kernel table.
    pub fn update_channel(&mut self, ch: &ChannelRef) {
        let (fd, events, state) = {
            let c = ch.borrow();
            (c.fd(), c.events(), c.state())
        };
        trace!(fd, events = ?events, state = ?state, "update channel");

        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.insert(fd, ch.clone());
                }
                ch.borrow_mut().set_state(PollerState::Added);
                let event = EpollEvent::new(events, fd as u64);
                if let Err(e) = self.epoll.add(Self::borrow_fd(fd), event) {
                    error!(fd, error = %e, "epoll_ctl add failed");
                }
            }
            PollerState::Added => {
                if events.is_empty() {
                    ch.borrow_mut().set_state(PollerState::Deleted);
                    if let Err(e) = self.epoll.delete(Self::borrow_fd(fd)) {
                        error!(fd, error = %e, "epoll_ctl del failed");
                    }
                } else {
                    let mut event = EpollEvent::new(events, fd as u64);
                    if let Err(e) = self.epoll.modify(Self::borrow_fd(fd), &mut event) {
                        error!(fd, error = %e, "epoll_ctl mod failed");
                    }
                }
            }
        }
    }

    /// Drop a channel from both the kernel table and the map, resetting its
    /// registration state so it could be re-registered from scratch.
    pub fn remove_channel(&mut self, ch: &ChannelRef) {
        let (fd, state) = {
            let c = ch.borrow();
            (c.fd(), c.state())
        };
        self.channels.remove(&fd);
        if state == PollerState::Added {
            if let Err(e) = self.epoll.delete(Self::borrow_fd(fd)) {
                error!(fd, error = %e, "epoll_ctl del failed");
            }
        }
        ch.borrow_mut().set_state(PollerState::New);
    }

    pub fn has_channel(&self, ch: &ChannelRef) -> bool {
        self.channels
            .get(&ch.borrow().fd())
            .is_some_and(|found| Rc::ptr_eq(found, ch))
    }

    pub fn channel(&self, fd: RawFd) -> Option<ChannelRef> {
        self.channels.get(&fd).cloned()
    }

    fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
        // The poller map only holds descriptors whose owners outlive their
        // registration; removal happens before the owning object closes them.
        unsafe { BorrowedFd::borrow_raw(fd) }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsFd, AsRawFd};

    use nix::sys::epoll::EpollFlags;
    use nix::sys::eventfd::{EfdFlags, EventFd};

    use super::*;

    #[test]
    fn test_registration_state_machine() {
        let mut poller = Poller::new().unwrap();
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let ch = Channel::new(efd.as_fd().as_raw_fd());

        // New with read interest: registered and mapped.
        ch.borrow_mut().set_events(EpollFlags::EPOLLIN);
        poller.update_channel(&ch);
        assert_eq!(ch.borrow().state(), PollerState::Added);
        assert!(poller.has_channel(&ch));

        // Empty interest: unregistered from the kernel but still mapped.
        ch.borrow_mut().set_events(EpollFlags::empty());
        poller.update_channel(&ch);
        assert_eq!(ch.borrow().state(), PollerState::Deleted);
        assert!(poller.has_channel(&ch));

        // Re-enable: re-registered without a fresh map insert.
        ch.borrow_mut().set_events(EpollFlags::EPOLLIN);
        poller.update_channel(&ch);
        assert_eq!(ch.borrow().state(), PollerState::Added);

        poller.remove_channel(&ch);
        assert_eq!(ch.borrow().state(), PollerState::New);
        assert!(!poller.has_channel(&ch));
    }

    #[test]
    fn test_poll_reports_ready_channel() {
        let mut poller = Poller::new().unwrap();
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let ch = Channel::new(efd.as_fd().as_raw_fd());
        ch.borrow_mut().set_events(EpollFlags::EPOLLIN);
        poller.update_channel(&ch);

        efd.arm().unwrap();
        let mut active = Vec::new();
        let time = poller.poll(EpollTimeout::from(1000u16), &mut active);
        assert!(time.is_valid());
        assert_eq!(active.len(), 1);
        assert!(Rc::ptr_eq(&active[0], &ch));
    }

    #[test]
    fn test_poll_timeout_is_not_an_error() {
        let mut poller = Poller::new().unwrap();
        let mut active = Vec::new();
        poller.poll(EpollTimeout::from(10u16), &mut active);
        assert!(active.is_empty());
    }
}
