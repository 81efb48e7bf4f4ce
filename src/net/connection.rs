//! One established TCP connection and its lifecycle.
//!
//! A [TcpConnection] is shared as an `Arc`: the server registry holds one
//! reference, user callbacks receive temporary ones, and every deferred task
//! in flight keeps the object alive until it runs. All I/O and every state
//! side effect happens on the connection's owning loop thread; the `Send +
//! Sync` surface exists so other threads can hand work over, not so they can
//! touch the socket.
//!
//! States move in one direction only, Connecting through Disconnected, and
//! the transition function enforces that: a stale deferred task cannot drag a
//! closed connection back to life, it is rejected and logged.

use std::any::Any;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nix::errno::Errno;
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::write;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::net::addr::InetAddress;
use crate::net::socket::Socket;
use crate::reactor::{Channel, EventLoop, LoopHandle};
use crate::timestamp::Timestamp;

/// How connections are shared between the server registry, callbacks, and
/// deferred tasks.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on establishment and again on disconnect; check
/// [connected](TcpConnection::connected) to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked with the inbound buffer whenever the socket produced data; consume
/// what you can and leave the rest for the next readable event.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
/// Invoked after the outbound buffer fully drained to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when queued outbound bytes first cross the configured mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
/// Internal: lets the owning server drop its registry entry.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Outbound backlog at which the high-water-mark callback fires, unless
/// overridden per connection.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    // Set once by new_cyclic; lets &self methods mint the Arc that callbacks
    // and deferred tasks carry.
    self_weak: Weak<TcpConnection>,
    event_loop: LoopHandle,
    name: String,
    socket: Socket,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: AtomicU8,
    destroyed: AtomicBool,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Wrap an accepted descriptor. The connection starts in `Connecting`;
    /// nothing is registered with the loop until
    /// [connect_established](TcpConnection::connect_established) runs there.
    pub(crate) fn new(
        event_loop: LoopHandle,
        name: String,
        fd: OwnedFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnectionPtr {
        let socket = Socket::from_fd(fd);
        socket.set_keep_alive(true);
        Arc::new_cyclic(|self_weak| TcpConnection {
            self_weak: self_weak.clone(),
            event_loop,
            name,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            destroyed: AtomicBool::new(false),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    // A live &self guarantees at least one strong reference.
    fn ptr(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection is alive")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_address(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The handle of the loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.event_loop
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.lock().unwrap().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    // The single transition point. fetch_max makes the state monotonic no
    // matter how calls interleave; an attempt to move backward leaves the
    // state alone and is logged. Returns the state before the call.
    fn set_state(&self, to: ConnState) -> ConnState {
        let prev = self.state.fetch_max(to as u8, Ordering::AcqRel);
        if prev > to as u8 {
            warn!(
                name = %self.name,
                from = ?ConnState::from_u8(prev),
                to = ?to,
                "rejected backward state transition"
            );
        }
        ConnState::from_u8(prev)
    }

    /// Queue `data` for delivery. A no-op unless the connection is currently
    /// `Connected`; off-thread callers pay one copy to move the bytes onto
    /// the loop.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            trace!(name = %self.name, "send on non-connected connection dropped");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, data);
                return;
            }
        }
        let conn = self.ptr();
        let data = data.to_vec();
        self.event_loop
            .queue_in_loop(move |lp| conn.send_in_loop(lp, &data));
    }

    // Write directly when nothing is queued and write interest is off;
    // otherwise append and let handle_write drain. The high-water check runs
    // against the backlog as it stands after the attempted write, so one
    // upward crossing fires the callback exactly once.
    fn send_in_loop(&self, lp: &EventLoop, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "connection is down, dropping outbound bytes");
            return;
        }
        let channel = lp.channel(self.socket.fd());
        let watching_write = channel
            .as_ref()
            .map(|ch| ch.borrow().is_writing())
            .unwrap_or(false);

        let mut output = self.output.lock().unwrap();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if !watching_write && output.readable_bytes() == 0 {
            match write(&self.socket, data) {
                Ok(n) => {
                    nwrote = n;
                    remaining -= n;
                    if remaining == 0 {
                        let cb = self.callbacks.lock().unwrap().write_complete.clone();
                        if let Some(cb) = cb {
                            let conn = self.ptr();
                            lp.queue_in_loop(move |_| cb(&conn));
                        }
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "write failed");
                    if e == Errno::EPIPE || e == Errno::ECONNRESET {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.callbacks.lock().unwrap().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.ptr();
                    let queued = old_len + remaining;
                    lp.queue_in_loop(move |_| cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if let Some(ch) = &channel {
                if !watching_write {
                    Channel::enable_writing(ch, lp);
                }
            }
        }
    }

    /// Half-close the write side once the outbound buffer drains. Only a
    /// `Connected` connection transitions; repeated calls are no-ops.
    pub fn shutdown(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            let conn = self.ptr();
            self.event_loop
                .run_in_loop(move |lp| conn.shutdown_in_loop(lp));
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        let writing = lp
            .channel(self.socket.fd())
            .map(|ch| ch.borrow().is_writing())
            .unwrap_or(false);
        // With write interest still on there are queued bytes; handle_write
        // performs the half-close after the final drain.
        if !writing {
            self.socket.shutdown_write();
        }
    }

    fn handle_read(&self, lp: &EventLoop, time: Timestamp) {
        let mut input = self.input.lock().unwrap();
        match input.read_fd(&self.socket) {
            Ok(0) => {
                drop(input);
                self.handle_close(lp);
            }
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "readable");
                let cb = self.callbacks.lock().unwrap().message.clone();
                if let Some(cb) = cb {
                    cb(&self.ptr(), &mut input, time);
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "read failed");
                drop(input);
                self.handle_error(lp);
            }
        }
    }

    fn handle_write(&self, lp: &EventLoop) {
        let channel = match lp.channel(self.socket.fd()) {
            Some(ch) => ch,
            None => return,
        };
        if !channel.borrow().is_writing() {
            trace!(name = %self.name, "write interest already gone, nothing to drain");
            return;
        }

        let mut output = self.output.lock().unwrap();
        match output.write_fd(&self.socket) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    Channel::disable_writing(&channel, lp);
                    let cb = self.callbacks.lock().unwrap().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.ptr();
                        lp.queue_in_loop(move |_| cb(&conn));
                    }
                    drop(output);
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop(lp);
                    }
                }
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "drain write failed");
            }
        }
    }

    fn handle_close(&self, lp: &EventLoop) {
        debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(ConnState::Disconnected);
        if let Some(channel) = lp.channel(self.socket.fd()) {
            Channel::disable_all(&channel, lp);
        }

        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.connection.clone(), cbs.close.clone())
        };
        let conn = self.ptr();
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    fn handle_error(&self, _lp: &EventLoop) {
        match getsockopt(&self.socket, sockopt::SocketError) {
            Ok(err) => {
                error!(name = %self.name, error = %Errno::from_raw(err), "connection error")
            }
            Err(e) => error!(name = %self.name, error = %e, "reading SO_ERROR failed"),
        }
    }

    /// Final wiring step, on the owning loop: build the channel, tie it to
    /// this connection's liveness, start reading, and announce establishment.
    pub(crate) fn connect_established(&self, lp: &EventLoop) {
        let prev = self.set_state(ConnState::Connected);
        debug_assert_eq!(prev, ConnState::Connecting);

        let channel = Channel::new(self.socket.fd());
        {
            let mut ch = channel.borrow_mut();
            let weak = self.self_weak.clone();
            ch.set_read_callback({
                let weak = weak.clone();
                move |lp, _, time| {
                    if let Some(conn) = Weak::upgrade(&weak) {
                        conn.handle_read(lp, time);
                    }
                }
            });
            ch.set_write_callback({
                let weak = weak.clone();
                move |lp, _| {
                    if let Some(conn) = Weak::upgrade(&weak) {
                        conn.handle_write(lp);
                    }
                }
            });
            ch.set_close_callback({
                let weak = weak.clone();
                move |lp, _| {
                    if let Some(conn) = Weak::upgrade(&weak) {
                        conn.handle_close(lp);
                    }
                }
            });
            ch.set_error_callback(move |lp, _| {
                if let Some(conn) = Weak::upgrade(&weak) {
                    conn.handle_error(lp);
                }
            });
            let guard: Arc<dyn Any + Send + Sync> = self.ptr();
            ch.tie(&guard);
        }
        Channel::enable_reading(&channel, lp);
        debug!(name = %self.name, peer = %self.peer_addr, "connection established");

        let cb = self.callbacks.lock().unwrap().connection.clone();
        if let Some(cb) = cb {
            cb(&self.ptr());
        }
    }

    /// Last teardown step, on the owning loop. Idempotent: whichever of the
    /// close path and the server's drop gets here first does the work.
    pub(crate) fn connect_destroyed(&self, lp: &EventLoop) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let prev = self.set_state(ConnState::Disconnected);
        if prev == ConnState::Connected {
            if let Some(channel) = lp.channel(self.socket.fd()) {
                Channel::disable_all(&channel, lp);
            }
            let cb = self.callbacks.lock().unwrap().connection.clone();
            if let Some(cb) = cb {
                cb(&self.ptr());
            }
        }
        if let Some(channel) = lp.channel(self.socket.fd()) {
            lp.remove_channel(&channel);
        }
        debug!(name = %self.name, "connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::read;

    use crate::reactor::EventLoop;

    use super::*;

    fn pipe_connection() -> (TcpConnectionPtr, std::os::fd::OwnedFd, std::rc::Rc<EventLoop>) {
        let lp = EventLoop::new().unwrap();
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        let conn = TcpConnection::new(
            lp.handle(),
            "test-conn#1".to_string(),
            ours,
            InetAddress::loopback(1),
            InetAddress::loopback(2),
        );
        (conn, theirs, lp)
    }

    #[test]
    fn test_send_before_established_is_dropped() {
        let (conn, theirs, _lp) = pipe_connection();
        assert_eq!(conn.state(), ConnState::Connecting);
        conn.send(b"too early");

        let mut buf = [0u8; 64];
        assert_eq!(read(theirs.as_raw_fd(), &mut buf).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn test_state_never_moves_backward() {
        let (conn, _theirs, _lp) = pipe_connection();
        conn.set_state(ConnState::Disconnected);
        conn.set_state(ConnState::Connected);
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_shutdown_requires_connected() {
        let (conn, _theirs, _lp) = pipe_connection();
        conn.shutdown();
        // Still connecting: the half-close transition did not happen.
        assert_eq!(conn.state(), ConnState::Connecting);
    }
}
