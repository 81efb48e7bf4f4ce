//! The [self] package handles all logic relating to accepting and managing
//! TCP connections on top of the reactor. It exposes the following objects:
//! - [TcpServer] which accepts connections and fans them out over loop
//!   threads.
//! - [TcpConnection] which represents one established connection, with
//!   buffered nonblocking reads and writes.
//! - [InetAddress] which is the IPv4 endpoint type the crate trades in.
//!
//! The listening socket, the accept machinery, and the raw descriptor wrapper
//! stay internal; applications only ever see connections handed to their
//! callbacks.

mod acceptor;
mod addr;
mod connection;
mod server;
mod socket;

pub use addr::InetAddress;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use server::TcpServer;
