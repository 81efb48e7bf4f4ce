//! A dedicated thread that owns and runs one event loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::Result;
use crate::reactor::handle::LoopHandle;
use crate::reactor::EventLoop;

/// Runs once on a freshly created loop, before it starts, on its own thread.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Owns a spawned thread whose sole job is running an [EventLoop]. Dropping
/// the wrapper quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            handle: None,
            thread: None,
        }
    }

    /// Spawn the thread, wait until its loop is constructed and running, and
    /// return a handle onto it. A loop construction failure on the new thread
    /// is propagated back to the caller.
    pub fn start_loop(&mut self) -> Result<LoopHandle> {
        assert!(self.thread.is_none(), "loop thread is already started");

        let ready = Arc::new((Mutex::new(None::<Result<LoopHandle>>), Condvar::new()));
        let publish = ready.clone();
        let init = self.init.clone();
        let name = self.name.clone();

        let thread = std::thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::new() {
                Ok(lp) => lp,
                Err(e) => {
                    let (slot, cond) = &*publish;
                    *slot.lock().unwrap() = Some(Err(e));
                    cond.notify_one();
                    return;
                }
            };
            if let Some(init) = &init {
                init(&event_loop);
            }
            {
                let (slot, cond) = &*publish;
                *slot.lock().unwrap() = Some(Ok(event_loop.handle()));
                cond.notify_one();
            }
            event_loop.run();
        })?;

        let (slot, cond) = &*ready;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = cond.wait(guard).unwrap();
        }
        let handle = guard.take().unwrap()?;

        self.handle = Some(handle.clone());
        self.thread = Some(thread);
        Ok(handle)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            debug!(name = %self.name, "joining loop thread");
            if thread.join().is_err() {
                warn!(name = %self.name, "loop thread panicked");
            }
        }
    }
}
