//! A fixed pool of loop threads with round-robin hand-out.
//!
//! Servers keep accepting on a base loop and spread accepted connections over
//! the pool. With zero worker threads everything runs on the base loop, which
//! is the single-threaded configuration.

use std::cmp;

use tracing::info;

use crate::error::Result;
use crate::reactor::handle::LoopHandle;
use crate::reactor::thread::{EventLoopThread, ThreadInitCallback};

pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// One worker loop per available core, never less than one.
    pub fn default_pool_size() -> usize {
        cmp::max(1, num_cpus::get())
    }

    /// Must be called before [start](EventLoopThreadPool::start). Zero keeps
    /// all work on the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    /// Spawn the worker threads and wait until every loop is running. With
    /// zero workers the init callback still runs, on the base loop.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<()> {
        assert!(!self.started, "pool is already started");
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            let handle = thread.start_loop()?;
            self.threads.push(thread);
            self.loops.push(handle);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                self.base.run_in_loop(move |lp| init(lp));
            }
        }
        info!(name = %self.name, threads = self.num_threads, "loop pool started");
        Ok(())
    }

    /// Pick the loop for the next connection: round-robin over the workers,
    /// or the base loop when the pool has none.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let picked = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        picked
    }

    /// Every loop that serves connections, base included when it is the only
    /// one.
    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}
