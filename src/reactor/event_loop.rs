//! The reactor core: one loop, one thread, forever.
//!
//! An [EventLoop] owns a poller and drives the wait/dispatch cycle for every
//! channel registered with it. The loop object itself never leaves the thread
//! that created it; other threads interact with it through a [LoopHandle],
//! which queues closures and wakes the loop via an eventfd that the loop
//! watches like any other descriptor.

use std::cell::{Cell, RefCell};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::{debug, trace, warn};

use crate::current_thread;
use crate::error::{Error, Result};
use crate::reactor::channel::{Channel, ChannelRef};
use crate::reactor::handle::{LoopHandle, LoopShared};
use crate::reactor::poller::Poller;

/// How long one poll pass may block with nothing ready.
const POLL_TIMEOUT_MS: u16 = 10_000;

thread_local! {
    /// The loop running on this thread, if any. Enforces one loop per thread
    /// and lets [LoopHandle::run_in_loop] execute inline when the caller is
    /// already on the loop thread.
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: RefCell<Poller>,
    looping: Cell<bool>,
    wakeup_channel: ChannelRef,
}

impl EventLoop {
    /// Create the loop for the calling thread and claim the thread's loop
    /// slot. Fails with [Error::LoopExists] when the thread already runs one.
    pub fn new() -> Result<Rc<EventLoop>> {
        let tid = current_thread::tid();
        let occupied = CURRENT_LOOP.with(|cur| cur.borrow().upgrade().is_some());
        if occupied {
            return Err(Error::LoopExists(tid));
        }

        let poller = Poller::new()?;
        let wakeup = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )?;
        let shared = Arc::new(LoopShared {
            tid,
            wakeup,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let wakeup_channel = Channel::new(shared.wakeup.as_fd().as_raw_fd());
        let event_loop = Rc::new(EventLoop {
            shared: shared.clone(),
            poller: RefCell::new(poller),
            looping: Cell::new(false),
            wakeup_channel: wakeup_channel.clone(),
        });

        // Drain the eventfd counter so the next wakeup registers as a fresh
        // readiness edge for level-triggered polling.
        wakeup_channel.borrow_mut().set_read_callback(move |_, _, _| {
            if let Err(e) = shared.wakeup.read() {
                warn!(error = %e, "draining wakeup eventfd failed");
            }
        });
        Channel::enable_reading(&wakeup_channel, &event_loop);

        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Rc::downgrade(&event_loop));
        debug!(tid, "event loop created");
        Ok(event_loop)
    }

    /// The loop running on the calling thread, if any.
    pub(crate) fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|cur| cur.borrow().upgrade())
    }

    /// A cloneable, `Send` reference for queueing work and quitting.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.tid == current_thread::tid()
    }

    /// See [LoopHandle::run_in_loop].
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.handle().queue_in_loop(task);
        }
    }

    /// See [LoopHandle::queue_in_loop].
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    /// See [LoopHandle::quit].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Run the wait/dispatch cycle until [quit](EventLoop::quit) is observed.
    /// Must be called from the thread that created the loop.
    pub fn run(&self) {
        assert!(self.is_in_loop_thread());
        assert!(!self.looping.get(), "loop is already running");
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);
        debug!(tid = self.shared.tid, "event loop starts");

        let mut active: Vec<ChannelRef> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let time = self
                .poller
                .borrow_mut()
                .poll(EpollTimeout::from(POLL_TIMEOUT_MS), &mut active);
            for ch in &active {
                Channel::handle_event(ch, self, time);
            }
            self.do_pending_tasks();
        }

        debug!(tid = self.shared.tid, "event loop stops");
        self.looping.set(false);
    }

    // Swap the queue out under the lock, then run the tasks without it so
    // they can queue more work freely. `calling_pending` stays set for the
    // whole drain; see LoopShared.
    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = mem::take(&mut *self.shared.pending.lock().unwrap());
        if !tasks.is_empty() {
            trace!(count = tasks.len(), "running pending tasks");
        }
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }

    pub(crate) fn update_channel(&self, ch: &ChannelRef) {
        self.poller.borrow_mut().update_channel(ch);
    }

    pub(crate) fn remove_channel(&self, ch: &ChannelRef) {
        self.poller.borrow_mut().remove_channel(ch);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, ch: &ChannelRef) -> bool {
        self.poller.borrow().has_channel(ch)
    }

    /// Look up the registered channel for a descriptor. Connection objects are
    /// shared across threads, so they resolve their loop-local channel this
    /// way instead of holding an `Rc` themselves.
    pub(crate) fn channel(&self, fd: RawFd) -> Option<ChannelRef> {
        self.poller.borrow().channel(fd)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        Channel::disable_all(&self.wakeup_channel, self);
        self.remove_channel(&self.wakeup_channel);
        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Weak::new());
        debug!(tid = self.shared.tid, "event loop destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn test_second_loop_on_same_thread_is_rejected() {
        let _lp = EventLoop::new().unwrap();
        match EventLoop::new() {
            Err(Error::LoopExists(tid)) => assert_eq!(tid, current_thread::tid()),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second loop on the same thread must be rejected"),
        }
    }

    #[test]
    fn test_thread_slot_is_freed_on_drop() {
        {
            let _lp = EventLoop::new().unwrap();
        }
        assert!(EventLoop::new().is_ok());
    }

    #[test]
    fn test_quit_from_foreign_thread_wakes_promptly() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let quitter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.quit();
        });

        let start = Instant::now();
        lp.run();
        quitter.join().unwrap();
        // Far below the poll timeout: the wakeup must interrupt the wait.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_in_loop_inline_on_loop_thread() {
        let lp = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();
        lp.handle().run_in_loop(move |_| {
            tx.send(current_thread::tid()).unwrap();
        });
        // Ran inline, no loop pass needed.
        assert_eq!(rx.try_recv().unwrap(), current_thread::tid());
    }

    #[test]
    fn test_tasks_from_foreign_thread_run_on_loop_thread() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let loop_tid = current_thread::tid();

        let (tx, rx) = mpsc::channel();
        let remote = handle.clone();
        let sender = std::thread::spawn(move || {
            remote.run_in_loop(move |_| {
                tx.send(current_thread::tid()).unwrap();
            });
        });
        sender.join().unwrap();

        handle.queue_in_loop(|lp| lp.quit());
        lp.run();
        assert_eq!(rx.recv().unwrap(), loop_tid);
    }
}
