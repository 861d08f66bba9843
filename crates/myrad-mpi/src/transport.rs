// transport.rs — framed message transports for the distributor
//
// The distributor is generic over a byte-frame transport. TCP carries
// frames between machines; the loopback pair carries them between
// threads of one process, which is also what the tests drive.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::packets::MAX_MPI_PACKET;

/// One end of a bidirectional frame pipe.
pub trait Transport: Send {
    fn send(&self, data: &[u8]) -> Result<(), String>;
    /// Next frame, waiting at most `timeout`. None on timeout or after
    /// disconnect; poll is_connected to distinguish.
    fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>>;
    fn is_connected(&self) -> bool;
}

// ============================================================
// Loopback
// ============================================================

pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    local_open: Arc<AtomicBool>,
    remote_open: Arc<AtomicBool>,
}

/// Cross-wired endpoint pair. Dropping either side disconnects both.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    let a_open = Arc::new(AtomicBool::new(true));
    let b_open = Arc::new(AtomicBool::new(true));
    (
        LoopbackTransport {
            tx: a_tx,
            rx: a_rx,
            local_open: a_open.clone(),
            remote_open: b_open.clone(),
        },
        LoopbackTransport {
            tx: b_tx,
            rx: b_rx,
            local_open: b_open,
            remote_open: a_open,
        },
    )
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.local_open.store(false, Ordering::SeqCst);
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, data: &[u8]) -> Result<(), String> {
        if !self.is_connected() {
            return Err("loopback peer disconnected".to_string());
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| "loopback peer disconnected".to_string())
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn is_connected(&self) -> bool {
        self.local_open.load(Ordering::SeqCst) && self.remote_open.load(Ordering::SeqCst)
    }
}

// ============================================================
// TCP
// ============================================================

/// TCP endpoint with a dedicated reader thread. Frames are u32
/// little-endian length prefixed. The reader thread owns the receive
/// half; writes go through a mutex.
pub struct TcpTransport {
    writer: Mutex<TcpStream>,
    rx: Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpTransport, String> {
        let stream = TcpStream::connect(addr).map_err(|e| format!("connect: {}", e))?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<TcpTransport, String> {
        stream
            .set_nodelay(true)
            .map_err(|e| format!("set_nodelay: {}", e))?;
        let reader = stream
            .try_clone()
            .map_err(|e| format!("stream clone: {}", e))?;

        let (tx, rx) = unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let connected_reader = connected.clone();
        std::thread::spawn(move || {
            read_frames(reader, tx, connected_reader);
        });

        Ok(TcpTransport {
            writer: Mutex::new(stream),
            rx,
            connected,
        })
    }
}

fn read_frames(mut stream: TcpStream, tx: Sender<Vec<u8>>, connected: Arc<AtomicBool>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MPI_PACKET {
            log::warn!("dropping oversized frame ({} bytes)", len);
            break;
        }
        let mut frame = vec![0u8; len];
        if stream.read_exact(&mut frame).is_err() {
            break;
        }
        if tx.send(frame).is_err() {
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
}

impl Transport for TcpTransport {
    fn send(&self, data: &[u8]) -> Result<(), String> {
        if !self.is_connected() {
            return Err("tcp peer disconnected".to_string());
        }
        let mut stream = self.writer.lock();
        let len = (data.len() as u32).to_le_bytes();
        stream
            .write_all(&len)
            .and_then(|_| stream.write_all(data))
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                format!("tcp send: {}", e)
            })
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Accept worker connections forever, handing each to the returned
/// channel. The master polls this between dispatch rounds so workers
/// can join a run already in progress.
pub fn spawn_accept_loop(listener: TcpListener) -> Receiver<Box<dyn Transport>> {
    let (tx, rx) = unbounded::<Box<dyn Transport>>();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            match TcpTransport::from_stream(stream) {
                Ok(t) => {
                    if tx.send(Box::new(t)).is_err() {
                        return;
                    }
                }
                Err(e) => log::warn!("rejecting worker connection: {}", e),
            }
        }
    });
    rx
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_round_trip() {
        let (a, b) = loopback_pair();
        a.send(b"hello").unwrap();
        let got = b.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got, b"hello");

        b.send(b"reply").unwrap();
        assert_eq!(a.recv_timeout(Duration::from_millis(100)).unwrap(), b"reply");
    }

    #[test]
    fn test_loopback_timeout() {
        let (a, _b) = loopback_pair();
        assert!(a.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_loopback_disconnect() {
        let (a, b) = loopback_pair();
        assert!(a.is_connected());
        drop(b);
        assert!(!a.is_connected());
        assert!(a.send(b"x").is_err());
    }

    #[test]
    fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = spawn_accept_loop(listener);

        let client = TcpTransport::connect(addr).unwrap();
        let server = accepted.recv_timeout(Duration::from_secs(2)).unwrap();

        client.send(b"from client").unwrap();
        assert_eq!(
            server.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"from client"
        );
        server.send(b"from server").unwrap();
        assert_eq!(
            client.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"from server"
        );
    }

    #[test]
    fn test_tcp_disconnect_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = spawn_accept_loop(listener);

        let client = TcpTransport::connect(addr).unwrap();
        let server = accepted.recv_timeout(Duration::from_secs(2)).unwrap();
        drop(client);

        // Reader thread notices EOF shortly after
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.is_connected() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_connected());
    }
}
