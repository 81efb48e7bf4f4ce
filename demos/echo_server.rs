//! A multi-threaded echo server.
//!
//! ```text
//! cargo run --example echo_server -- 0.0.0.0 9091
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use tracing::info;

use muxio::net::{InetAddress, TcpServer};
use muxio::reactor::{EventLoop, EventLoopThreadPool};

fn main() -> muxio::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <bind-ip> <port>", args[0]);
        process::exit(1);
    }
    let port: u16 = args[2].parse().unwrap_or_else(|_| {
        eprintln!("invalid port: {}", args[2]);
        process::exit(1);
    });
    let addr = InetAddress::from_ip_port(&args[1], port)?;

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, &addr, "echo")?;

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!(conn = %conn.name(), peer = %conn.peer_address(), "client connected");
        } else {
            info!(conn = %conn.name(), "client gone");
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, time| {
        let msg = buf.retrieve_all_as_string();
        info!(conn = %conn.name(), bytes = msg.len(), at = %time, "echoing");
        conn.send(msg.as_bytes());
    }));

    server.set_thread_num(EventLoopThreadPool::default_pool_size());
    server.start()?;
    info!(addr = %server.listen_addr(), "echo server listening");

    event_loop.run();
    Ok(())
}
