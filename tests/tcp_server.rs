//! End-to-end exercises of the server over real sockets: a client on plain
//! std networking talks to a server running on its own loop threads.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use muxio::net::{InetAddress, TcpServer};
use muxio::reactor::{EventLoop, LoopHandle};

/// Run `setup`-configured server on a dedicated main-loop thread, returning
/// the bound address and a handle for quitting it.
fn spawn_server<F>(setup: F) -> (InetAddress, LoopHandle, JoinHandle<()>)
where
    F: FnOnce(&TcpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&event_loop, &InetAddress::loopback(0), "itest").unwrap();
        server.set_thread_num(1);
        setup(&server);
        server.start().unwrap();
        tx.send((server.listen_addr(), event_loop.handle())).unwrap();
        event_loop.run();
    });
    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, thread)
}

fn read_exact_with_deadline(client: &mut TcpStream, want: usize) -> Vec<u8> {
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut got = Vec::with_capacity(want);
    let mut chunk = [0u8; 64 * 1024];
    while got.len() < want {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => panic!("read timed out"),
            Err(e) => panic!("client read failed: {}", e),
        }
    }
    got
}

#[test]
fn test_echo_round_trip_and_single_removal() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counted = disconnects.clone();

    let (addr, handle, thread) = spawn_server(move |server| {
        server.set_message_callback(Arc::new(|conn, buf, _| {
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
        }));
        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    });

    let mut client = TcpStream::connect(addr.ip_port()).unwrap();
    client.write_all(b"ping").unwrap();
    assert_eq!(read_exact_with_deadline(&mut client, 4), b"ping");

    // Half-close from the client; the server's read path observes EOF,
    // closes, and the connection leaves the registry exactly once.
    client.shutdown(Shutdown::Write).unwrap();
    let mut rest = [0u8; 16];
    assert_eq!(client.read(&mut rest).unwrap(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while disconnects.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn test_high_water_mark_fires_once_per_crossing() {
    const MARK: usize = 256 * 1024;
    const CHUNK: usize = 1024 * 1024;
    const CHUNKS: usize = 4;

    let crossings = Arc::new(AtomicUsize::new(0));
    let counted = crossings.clone();
    let (queued_tx, queued_rx) = mpsc::channel();
    let queued_tx = Mutex::new(queued_tx);

    let (addr, handle, thread) = spawn_server(move |server| {
        server.set_high_water_mark_callback(
            Arc::new(move |_, queued| {
                counted.fetch_add(1, Ordering::SeqCst);
                queued_tx.lock().unwrap().send(queued).unwrap();
            }),
            MARK,
        );
        // Flood the client the moment it connects; it is not reading yet, so
        // the outbound buffer must absorb most of this.
        server.set_connection_callback(Arc::new(|conn| {
            if conn.connected() {
                let payload = vec![b'z'; CHUNK];
                for _ in 0..CHUNKS {
                    conn.send(&payload);
                }
            }
        }));
    });

    let mut client = TcpStream::connect(addr.ip_port()).unwrap();
    let queued = queued_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(queued >= MARK);

    // Drain everything; the backlog never crosses upward again because no
    // new sends happen, so the counter stays at one.
    let got = read_exact_with_deadline(&mut client, CHUNK * CHUNKS);
    assert_eq!(got.len(), CHUNK * CHUNKS);
    assert!(got.iter().all(|&b| b == b'z'));
    assert_eq!(crossings.load(Ordering::SeqCst), 1);

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn test_shutdown_with_queued_bytes_delivers_everything() {
    const CHUNK: usize = 2 * 1024 * 1024;

    let (addr, handle, thread) = spawn_server(|server| {
        // Send a payload larger than the socket buffers and immediately ask
        // for the half-close; it must wait for the drain.
        server.set_connection_callback(Arc::new(|conn| {
            if conn.connected() {
                conn.send(&vec![b'q'; CHUNK]);
                conn.shutdown();
            }
        }));
    });

    let mut client = TcpStream::connect(addr.ip_port()).unwrap();
    let got = read_exact_with_deadline(&mut client, CHUNK);
    assert_eq!(got.len(), CHUNK, "half-close must be deferred until drained");

    // After the drain the write side closes for real.
    let mut rest = [0u8; 16];
    assert_eq!(client.read(&mut rest).unwrap(), 0);

    handle.quit();
    thread.join().unwrap();
}
