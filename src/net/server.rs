//! The accept-and-dispatch server tying the whole crate together.
//!
//! A [TcpServer] accepts on the loop that created it (the main loop) and
//! spreads connections over an [EventLoopThreadPool]; with zero pool threads
//! everything shares the main loop. The server owns the connection registry;
//! each connection's I/O runs entirely on the one sub-loop it was assigned at
//! accept time.
//!
//! Teardown is a two-hop dance: the close path runs on the connection's loop,
//! hops to the main loop to erase the registry entry, then hops back so the
//! channel is unregistered on the loop that owns it.

use std::collections::HashMap;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};

use crate::error::Result;
use crate::net::acceptor::Acceptor;
use crate::net::addr::InetAddress;
use crate::net::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::net::socket::Socket;
use crate::reactor::{EventLoop, EventLoopThreadPool, LoopHandle, ThreadInitCallback};

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    main: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    callbacks: Mutex<ServerCallbacks>,
}

pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Bind `addr` on the calling loop. The socket is bound (and port 0
    /// resolved) here; listening starts with [start](TcpServer::start).
    pub fn new(
        event_loop: &EventLoop,
        addr: &InetAddress,
        name: impl Into<String>,
    ) -> Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(addr, false)?;
        let bound = acceptor.bound_address();

        let inner = Arc::new(ServerInner {
            main: event_loop.handle(),
            ip_port: bound.ip_port(),
            pool: Mutex::new(EventLoopThreadPool::new(
                event_loop.handle(),
                format!("{}-io", name),
            )),
            name,
            acceptor: acceptor.clone(),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&inner);
        acceptor.set_new_connection_callback(Box::new(move |lp, fd, peer| {
            if let Some(inner) = Weak::upgrade(&weak) {
                ServerInner::new_connection(&inner, lp, fd, peer);
            }
        }));
        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound address, concrete even when constructed with port 0.
    pub fn listen_addr(&self) -> InetAddress {
        self.inner.acceptor.bound_address()
    }

    /// Number of I/O loop threads; zero (the default) keeps connections on
    /// the main loop. Must be set before [start](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.inner.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.inner.callbacks.lock().unwrap().high_water_mark = Some((cb, mark));
    }

    /// Runs once on each pool loop before it serves connections.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.inner.callbacks.lock().unwrap().thread_init = Some(cb);
    }

    /// Start the pool and begin accepting. Idempotent; only the first call
    /// does anything.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let init = self.inner.callbacks.lock().unwrap().thread_init.clone();
        self.inner.pool.lock().unwrap().start(init)?;

        let acceptor = self.inner.acceptor.clone();
        self.inner.main.run_in_loop(move |lp| {
            // Setup failure this deep is unrecoverable for the server.
            acceptor.listen(lp).expect("failed to start listening");
        });
        Ok(())
    }
}

impl ServerInner {
    // Runs on the main loop from the acceptor's read callback.
    fn new_connection(inner: &Arc<ServerInner>, _lp: &EventLoop, fd: OwnedFd, peer: InetAddress) {
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
        let io_loop = inner.pool.lock().unwrap().get_next_loop();

        let local = match Socket::local_addr_of(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(e) => {
                error!(conn = %conn_name, error = %e, "getsockname failed");
                inner.acceptor.bound_address()
            }
        };
        info!(conn = %conn_name, peer = %peer, "new connection");

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), fd, local, peer);
        {
            let cbs = inner.callbacks.lock().unwrap();
            if let Some(cb) = &cbs.connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &cbs.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &cbs.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
            if let Some((cb, mark)) = &cbs.high_water_mark {
                conn.set_high_water_mark_callback(cb.clone(), *mark);
            }
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = Weak::upgrade(&weak) {
                ServerInner::remove_connection(&inner, conn);
            }
        }));

        inner
            .connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        io_loop.run_in_loop(move |lp| conn.connect_established(lp));
    }

    // Runs on the connection's loop from the close path. First hop erases the
    // registry entry on the main loop, second hop finishes teardown back on
    // the connection's own loop.
    fn remove_connection(inner: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let weak = Arc::downgrade(inner);
        let conn = conn.clone();
        inner.main.run_in_loop(move |_| {
            if let Some(inner) = Weak::upgrade(&weak) {
                info!(conn = %conn.name(), "removing connection");
                if inner
                    .connections
                    .lock()
                    .unwrap()
                    .remove(conn.name())
                    .is_none()
                {
                    warn!(conn = %conn.name(), "connection was not registered");
                }
            }
            let io_loop = conn.loop_handle().clone();
            let conn = conn.clone();
            io_loop.queue_in_loop(move |lp| conn.connect_destroyed(lp));
        });
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let connections = mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let io_loop = conn.loop_handle().clone();
            io_loop.run_in_loop(move |lp| conn.connect_destroyed(lp));
        }
        let acceptor = self.acceptor.clone();
        self.main.run_in_loop(move |lp| acceptor.detach(lp));
        // The pool field drops after this body, quitting and joining the I/O
        // loops; the teardown tasks queued above run before those loops exit.
    }
}
