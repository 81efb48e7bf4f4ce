//! The per-descriptor event dispatcher.
//!
//! A [Channel] binds one file descriptor to the readiness events its owner
//! cares about and to the callbacks that consume them. It never owns the
//! descriptor and it never talks to the kernel itself; interest changes are
//! propagated through the owning [EventLoop] into its poller, and the poller
//! writes the observed ready set back before dispatch. A channel belongs to
//! exactly one loop and must only be touched from that loop's thread, which is
//! why it is shared as an `Rc` rather than an `Arc`.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use nix::sys::epoll::EpollFlags;
use tracing::trace;

use crate::reactor::EventLoop;
use crate::timestamp::Timestamp;

/// How channels are shared between the poller map, the ready list, and the
/// objects that embed them. Single-threaded by construction.
pub type ChannelRef = Rc<RefCell<Channel>>;

pub(crate) type ReadEventCallback = Rc<dyn Fn(&EventLoop, &ChannelRef, Timestamp)>;
pub(crate) type EventCallback = Rc<dyn Fn(&EventLoop, &ChannelRef)>;

const NONE_EVENT: EpollFlags = EpollFlags::empty();
const READ_EVENT: EpollFlags = EpollFlags::EPOLLIN.union(EpollFlags::EPOLLPRI);
const WRITE_EVENT: EpollFlags = EpollFlags::EPOLLOUT;

/// Registration state of a channel within its loop's poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    New,
    /// Present in both the kernel table and the poller map.
    Added,
    /// Removed from the kernel table but still known to the poller map.
    Deleted,
}

pub struct Channel {
    fd: RawFd,
    events: EpollFlags,
    revents: EpollFlags,
    state: PollerState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> ChannelRef {
        Rc::new(RefCell::new(Channel {
            fd,
            events: NONE_EVENT,
            revents: NONE_EVENT,
            state: PollerState::New,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> EpollFlags {
        self.events
    }

    pub(crate) fn set_events(&mut self, events: EpollFlags) {
        self.events = events;
    }

    pub(crate) fn set_revents(&mut self, revents: EpollFlags) {
        self.revents = revents;
    }

    pub(crate) fn state(&self) -> PollerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PollerState) {
        self.state = state;
    }

    pub fn is_none_event(&self) -> bool {
        self.events == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.intersects(READ_EVENT)
    }

    pub fn is_writing(&self) -> bool {
        self.events.contains(WRITE_EVENT)
    }

    pub fn set_read_callback<F>(&mut self, f: F)
    where
        F: Fn(&EventLoop, &ChannelRef, Timestamp) + 'static,
    {
        self.read_callback = Some(Rc::new(f));
    }

    pub fn set_write_callback<F>(&mut self, f: F)
    where
        F: Fn(&EventLoop, &ChannelRef) + 'static,
    {
        self.write_callback = Some(Rc::new(f));
    }

    pub fn set_close_callback<F>(&mut self, f: F)
    where
        F: Fn(&EventLoop, &ChannelRef) + 'static,
    {
        self.close_callback = Some(Rc::new(f));
    }

    pub fn set_error_callback<F>(&mut self, f: F)
    where
        F: Fn(&EventLoop, &ChannelRef) + 'static,
    {
        self.error_callback = Some(Rc::new(f));
    }

    /// Hold a weak reference to the object whose callbacks this channel
    /// invokes. A readiness event can already be queued for dispatch while
    /// that object is being torn down on the same tick; the guard makes such
    /// a dispatch a silent no-op instead of a call into a dead object.
    pub fn tie(&mut self, guard: &Arc<dyn Any + Send + Sync>) {
        self.tie = Some(Arc::downgrade(guard));
    }

    /// Add read interest and propagate the change to the loop's poller.
    pub fn enable_reading(ch: &ChannelRef, event_loop: &EventLoop) {
        ch.borrow_mut().events.insert(READ_EVENT);
        event_loop.update_channel(ch);
    }

    pub fn disable_reading(ch: &ChannelRef, event_loop: &EventLoop) {
        ch.borrow_mut().events.remove(READ_EVENT);
        event_loop.update_channel(ch);
    }

    pub fn enable_writing(ch: &ChannelRef, event_loop: &EventLoop) {
        ch.borrow_mut().events.insert(WRITE_EVENT);
        event_loop.update_channel(ch);
    }

    pub fn disable_writing(ch: &ChannelRef, event_loop: &EventLoop) {
        ch.borrow_mut().events.remove(WRITE_EVENT);
        event_loop.update_channel(ch);
    }

    pub fn disable_all(ch: &ChannelRef, event_loop: &EventLoop) {
        ch.borrow_mut().events = NONE_EVENT;
        event_loop.update_channel(ch);
    }

    /// Dispatch the ready set stamped by the poller to the registered
    /// callbacks.
    ///
    /// Order is fixed: close (a hang-up with no read interest left, so it is
    /// not a half-close the read path will observe), then error, then read,
    /// then write, each independently and only when a callback is set. The
    /// channel borrow is released before any callback runs so that handlers
    /// are free to mutate their own interest set.
    pub(crate) fn handle_event(ch: &ChannelRef, event_loop: &EventLoop, time: Timestamp) {
        let _guard: Option<Arc<dyn Any + Send + Sync>>;
        let (revents, read_cb, write_cb, close_cb, error_cb) = {
            let c = ch.borrow();
            match &c.tie {
                Some(tie) => match tie.upgrade() {
                    Some(guard) => _guard = Some(guard),
                    // The owning object is gone; skip dispatch entirely.
                    None => return,
                },
                None => _guard = None,
            }
            (
                c.revents,
                c.read_callback.clone(),
                c.write_callback.clone(),
                c.close_callback.clone(),
                c.error_callback.clone(),
            )
        };

        trace!(fd = ch.borrow().fd, revents = ?revents, "channel dispatch");

        if revents.contains(EpollFlags::EPOLLHUP) && !revents.contains(EpollFlags::EPOLLIN) {
            if let Some(cb) = &close_cb {
                cb(event_loop, ch);
            }
        }
        if revents.contains(EpollFlags::EPOLLERR) {
            if let Some(cb) = &error_cb {
                cb(event_loop, ch);
            }
        }
        if revents.intersects(READ_EVENT | EpollFlags::EPOLLRDHUP) {
            if let Some(cb) = &read_cb {
                cb(event_loop, ch, time);
            }
        }
        if revents.contains(EpollFlags::EPOLLOUT) {
            if let Some(cb) = &write_cb {
                cb(event_loop, ch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_mask_accessors() {
        let ch = Channel::new(42);
        {
            let c = ch.borrow();
            assert!(c.is_none_event());
            assert!(!c.is_reading());
            assert!(!c.is_writing());
        }

        ch.borrow_mut().events.insert(READ_EVENT);
        assert!(ch.borrow().is_reading());
        assert!(!ch.borrow().is_writing());

        ch.borrow_mut().events.insert(WRITE_EVENT);
        assert!(ch.borrow().is_writing());

        ch.borrow_mut().events = NONE_EVENT;
        assert!(ch.borrow().is_none_event());
    }

    #[test]
    fn test_state_starts_new() {
        let ch = Channel::new(7);
        assert_eq!(ch.borrow().state(), PollerState::New);
        assert_eq!(ch.borrow().fd(), 7);
    }
}
