//! The listening side of a server: owns the listen socket and turns readable
//! events on it into accepted descriptors for the server to wire up.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nix::errno::Errno;
use tracing::{error, info, trace};

use crate::error::Result;
use crate::net::addr::InetAddress;
use crate::net::socket::Socket;
use crate::reactor::{Channel, EventLoop};

/// Invoked on the main loop with each accepted descriptor and its peer.
pub(crate) type NewConnectionCallback = Box<dyn Fn(&EventLoop, OwnedFd, InetAddress) + Send + Sync>;

pub(crate) struct Acceptor {
    socket: Socket,
    bound_addr: InetAddress,
    listening: AtomicBool,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Create and bind the listen socket. Binding port 0 resolves to the
    /// kernel-chosen port immediately, so `bound_address` is always concrete.
    pub fn new(addr: &InetAddress, reuse_port: bool) -> Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true);
        if reuse_port {
            socket.set_reuse_port(true);
        }
        socket.bind_address(addr)?;
        let bound_addr = socket.local_address()?;
        Ok(Arc::new(Acceptor {
            socket,
            bound_addr,
            listening: AtomicBool::new(false),
            new_connection: Mutex::new(None),
        }))
    }

    pub fn bound_address(&self) -> InetAddress {
        self.bound_addr
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    /// Start listening and register the read channel with `event_loop`, which
    /// must be the loop the acceptor will live on.
    pub fn listen(self: &Arc<Self>, event_loop: &EventLoop) -> Result<()> {
        self.socket.listen()?;
        self.listening.store(true, Ordering::Release);

        let channel = Channel::new(self.socket.fd());
        let weak = Arc::downgrade(self);
        channel.borrow_mut().set_read_callback(move |lp, _, _| {
            if let Some(acceptor) = Weak::upgrade(&weak) {
                acceptor.handle_read(lp);
            }
        });
        Channel::enable_reading(&channel, event_loop);
        info!(addr = %self.bound_addr, "listening");
        Ok(())
    }

    // One accept per readiness event; level-triggered polling re-reports the
    // listener until the backlog is drained.
    fn handle_read(&self, event_loop: &EventLoop) {
        match self.socket.accept() {
            Ok((fd, peer)) => {
                trace!(peer = %peer, "accepted connection");
                let guard = self.new_connection.lock().unwrap();
                if let Some(cb) = guard.as_ref() {
                    cb(event_loop, fd, peer);
                } else {
                    // No handler wired up; dropping the OwnedFd closes it.
                    trace!(peer = %peer, "no connection handler, closing");
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(Errno::EMFILE) => {
                error!("accept failed: file descriptor limit reached");
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }

    /// Unregister the listen channel. Part of server teardown, on the main
    /// loop.
    pub fn detach(&self, event_loop: &EventLoop) {
        if let Some(channel) = event_loop.channel(self.socket.fd()) {
            Channel::disable_all(&channel, event_loop);
            event_loop.remove_channel(&channel);
        }
        self.listening.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_accepts_and_reports_peer() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&InetAddress::loopback(0), false).unwrap();
        let addr = acceptor.bound_address();
        assert_ne!(addr.port(), 0);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        acceptor.set_new_connection_callback(Box::new(move |lp, _fd, peer| {
            tx.lock().unwrap().send(peer).unwrap();
            lp.quit();
        }));
        acceptor.listen(&event_loop).unwrap();
        assert!(acceptor.listening());

        let client = TcpStream::connect(addr.ip_port()).unwrap();
        event_loop.run();

        let peer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer.port(), client.local_addr().unwrap().port());
    }
}
