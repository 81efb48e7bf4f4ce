//! Cached access to the calling thread's kernel id.
//!
//! `gettid` is a syscall, so the id is fetched once per thread and memoized in
//! thread local storage. Loop ownership checks compare these ids on every
//! cross-thread call, which makes the cache worthwhile.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<i32> = const { Cell::new(0) };
}

/// Return the kernel thread id of the calling thread.
pub fn tid() -> i32 {
    CACHED_TID.with(|cache| {
        let mut tid = cache.get();
        if tid == 0 {
            tid = nix::unistd::gettid().as_raw();
            cache.set(tid);
        }
        tid
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_is_stable() {
        assert_eq!(tid(), tid());
        assert!(tid() > 0);
    }

    #[test]
    fn test_tid_differs_across_threads() {
        let here = tid();
        let there = std::thread::spawn(tid).join().unwrap();
        assert_ne!(here, there);
    }
}
