//! # muxio
//!
//! A multi-threaded, nonblocking TCP networking library for linux built on
//! the reactor pattern. Each [reactor::EventLoop] owns an epoll instance and
//! runs on exactly one thread; a [net::TcpServer] accepts on its main loop
//! and spreads connections round-robin over a pool of loop threads. All I/O
//! for one connection happens on one loop, so application callbacks never
//! race with themselves. The package is split up into a handful of modules
//! each handling a specific subset of the functionality needed.
//!
//! At a high level a simple TCP echo server works as you would expect:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use muxio::net::{InetAddress, TcpServer};
//! use muxio::reactor::EventLoop;
//!
//! fn main() -> muxio::Result<()> {
//!     // One loop for this thread; it will accept connections and, with a
//!     // pool configured, hand them off to dedicated I/O threads.
//!     let event_loop = EventLoop::new()?;
//!
//!     let addr = InetAddress::any(9091);
//!     let server = TcpServer::new(&event_loop, &addr, "echo")?;
//!
//!     // Echo whatever arrives. The buffer hands back everything readable;
//!     // anything not consumed stays for the next readable event.
//!     server.set_message_callback(Arc::new(|conn, buf, _time| {
//!         let msg = buf.retrieve_all_as_string();
//!         conn.send(msg.as_bytes());
//!     }));
//!
//!     server.set_thread_num(4);
//!     server.start()?;
//!
//!     // Runs until quit() is called on this loop's handle.
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! Writes are buffered: [net::TcpConnection::send] is safe from any thread,
//! tries the kernel immediately when nothing is queued, and otherwise drains
//! through write-readiness events. Back-pressure is surfaced through the
//! write-complete and high-water-mark callbacks.

pub mod buffer;
pub mod current_thread;
pub mod error;
pub mod net;
pub mod reactor;
pub mod timestamp;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use net::{InetAddress, TcpConnection, TcpConnectionPtr, TcpServer};
pub use reactor::{EventLoop, EventLoopThreadPool, LoopHandle};
pub use timestamp::Timestamp;
