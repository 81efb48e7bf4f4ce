//! The shareable, `Send` half of an event loop.
//!
//! An [EventLoop](crate::reactor::EventLoop) itself is pinned to its thread,
//! but other threads still need to hand it work, wake it, and ask it to stop.
//! [LoopHandle] is the cloneable front for exactly those operations; every
//! cross-thread interaction with a loop flows through one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::eventfd::EventFd;
use tracing::{error, trace};

use crate::current_thread;
use crate::reactor::EventLoop;

/// A unit of deferred work executed on the loop's own thread. The closure
/// receives the loop so it can register channels or queue further work.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

/// State shared between a loop and all handles onto it.
pub(crate) struct LoopShared {
    /// Kernel id of the thread the loop runs on; fixed at construction.
    pub tid: i32,
    /// Kicks the loop out of `epoll_wait` when work arrives from outside.
    pub wakeup: EventFd,
    pub pending: Mutex<Vec<Task>>,
    /// True while the loop thread is draining the pending queue; tasks queued
    /// during the drain must wake the loop again or they would sit until the
    /// next readiness event.
    pub calling_pending: AtomicBool,
    pub quit: AtomicBool,
}

/// A cloneable, thread-safe reference to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.tid == current_thread::tid()
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise queued for the loop's next pass.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            match EventLoop::current() {
                Some(lp) => task(&lp),
                // The loop is mid-teardown on its own thread; late work is
                // dropped the same way a queued task to a dead loop would be.
                None => trace!("run_in_loop on loop thread without a live loop"),
            }
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop's next pass, waking the loop when the caller
    /// is a foreign thread or the loop is already draining its queue.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.pending.lock().unwrap().push(Box::new(task));

        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Ask the loop to exit after its current pass. Safe from any thread;
    /// cross-thread callers additionally wake the loop so the request is seen
    /// without waiting out the poll timeout.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub(crate) fn wakeup(&self) {
        if let Err(e) = self.shared.wakeup.arm() {
            error!(error = %e, "failed to wake event loop");
        }
    }
}
