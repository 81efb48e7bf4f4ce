//! The reactor: event loops, their channels, and the threads that run them.
//!
//! The threading rule is one loop per thread and one thread per loop. A loop
//! and its channels are thread-confined; the [LoopHandle] is the `Send` face
//! used to reach a loop from anywhere else.

mod channel;
mod event_loop;
mod handle;
mod poller;
mod pool;
mod thread;

pub use channel::{Channel, ChannelRef};
pub use event_loop::EventLoop;
pub use handle::{LoopHandle, Task};
pub use pool::EventLoopThreadPool;
pub use thread::{EventLoopThread, ThreadInitCallback};
