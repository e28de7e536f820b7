//! One TCP session: a reader thread that reassembles packets into
//! [`Transaction`]s, and a pass-through write half.
//!
//! The reader never touches shared state. Everything it produces, including
//! the news that it stopped, goes onto the bounded inbound queue.

use crate::error::FrameError;
use crate::packet::Packet;
use crate::protocol::{defaults, timeouts};
use crate::reassembler::Reassembler;
use crossbeam_channel::{SendTimeoutError, Sender};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown as SocketShutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Stop signal shared by every thread of a server or client.
///
/// A [`Shutdown::child`] has its own flag but also reports the parent's,
/// so one connection can be stopped without stopping the server.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<Shutdown>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_triggered())
    }
}

/// A decoded packet and the identity of the connection it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub packet: Packet,
    pub source: String,
}

/// What a reader thread hands to its consumer
#[derive(Debug)]
pub enum Inbound {
    Transaction(Transaction),
    Closed { source: String, reason: CloseReason },
}

/// Why a read loop ended
#[derive(Debug)]
pub enum CloseReason {
    Eof,
    Shutdown,
    QueueClosed,
    Framing(FrameError),
    Io(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "peer closed the connection"),
            CloseReason::Shutdown => write!(f, "shutdown requested"),
            CloseReason::QueueClosed => write!(f, "inbound queue closed"),
            CloseReason::Framing(e) => write!(f, "framing error: {e}"),
            CloseReason::Io(e) => write!(f, "read error: {e}"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Bytes requested per socket read
    pub chunk_size: usize,
    /// Read deadline; each expiry is a chance to observe shutdown
    pub timeout: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            chunk_size: defaults::READ_CHUNK_SIZE,
            timeout: Duration::from_millis(timeouts::READ_MS),
        }
    }
}

/// Push onto a bounded queue, blocking while it is full.
/// Gives up (returning false) on shutdown or when the receiver is gone.
pub fn send_or_stop<T>(queue: &Sender<T>, mut item: T, shutdown: &Shutdown) -> bool {
    let wait = Duration::from_millis(timeouts::QUEUE_PUSH_MS);
    loop {
        match queue.send_timeout(item, wait) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if shutdown.is_triggered() {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Read `source` until EOF, error or shutdown, forwarding every complete
/// packet to `queue` in arrival order.
pub fn read_loop<R: Read>(
    source: &mut R,
    id: &str,
    chunk_size: usize,
    queue: &Sender<Inbound>,
    shutdown: &Shutdown,
) -> CloseReason {
    let mut reassembler = Reassembler::new(chunk_size);
    let mut chunk = vec![0u8; chunk_size.max(1)];

    loop {
        if shutdown.is_triggered() {
            return CloseReason::Shutdown;
        }

        let n = match source.read(&mut chunk) {
            Ok(0) => return CloseReason::Eof,
            Ok(n) => n,
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return CloseReason::Io(e),
        };

        for frame in reassembler.feed(&chunk[..n]) {
            let packet = match frame {
                Ok(packet) => packet,
                Err(e) => return CloseReason::Framing(e),
            };
            trace!(
                connection = %id,
                opcode = packet.header().opcode,
                len = packet.payload().len(),
                "packet reassembled"
            );
            let transaction = Transaction {
                packet,
                source: id.to_string(),
            };
            if !send_or_stop(queue, Inbound::Transaction(transaction), shutdown) {
                return if shutdown.is_triggered() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::QueueClosed
                };
            }
        }
    }
}

// Disable Nagle (frames are small) and bound every blocking write so a
// stalled peer cannot hide a shutdown
fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(Duration::from_millis(timeouts::WRITE_POLL_MS)))
}

/// A live TCP session. The read half runs on its own thread once
/// [`Connection::spawn_reader`] is called; writes go straight to the socket.
pub struct Connection {
    id: String,
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
    /// Stops this connection only; a child of the owner's token once the reader runs
    stop: Shutdown,
    /// Give up on a write after this long without progress
    write_limit: Option<Duration>,
}

impl Connection {
    /// Wrap an accepted or connected socket, identified by its peer address
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let id = stream.peer_addr()?.to_string();
        Self::with_id(id, stream)
    }

    pub fn with_id(id: impl Into<String>, stream: TcpStream) -> io::Result<Self> {
        tune_socket(&stream)?;
        Ok(Connection {
            id: id.into(),
            stream,
            reader: None,
            stop: Shutdown::new(),
            write_limit: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Writes that make no progress for `limit` fail with `TimedOut`.
    /// Without a limit they wait until the peer drains or shutdown.
    pub fn set_write_limit(&mut self, limit: Option<Duration>) {
        self.write_limit = limit;
    }

    /// Start the read loop. When it ends, a [`Inbound::Closed`] event is
    /// posted so the owner can evict this connection.
    pub fn spawn_reader(
        &mut self,
        queue: Sender<Inbound>,
        shutdown: Shutdown,
        options: ReadOptions,
    ) -> io::Result<()> {
        let mut source = self.stream.try_clone()?;
        source.set_read_timeout(Some(options.timeout))?;
        let id = self.id.clone();
        self.stop = shutdown.child();
        let stop = self.stop.clone();

        let handle = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || {
                debug!(connection = %id, "reader started");
                let reason = read_loop(&mut source, &id, options.chunk_size, &queue, &stop);
                match &reason {
                    CloseReason::Framing(_) | CloseReason::Io(_) => {
                        warn!(connection = %id, reason = %reason, "reader stopped")
                    }
                    _ => debug!(connection = %id, reason = %reason, "reader stopped"),
                }
                let _ = source.shutdown(SocketShutdown::Read);
                send_or_stop(&queue, Inbound::Closed { source: id, reason }, &stop);
            })?;
        self.reader = Some(handle);
        Ok(())
    }

    pub fn send(&mut self, packet: &Packet) -> io::Result<()> {
        self.write_all(&packet.encode())
    }

    /// Stop the reader, shut the socket down and wait for the reader thread.
    /// The reader gives up on a full inbound queue once stopped, so this
    /// never waits on whoever drains that queue.
    pub fn close(&mut self) {
        self.stop.trigger();
        let _ = self.stream.shutdown(SocketShutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// Pass-through to the socket, no queueing. A write deadline only means
// "check for shutdown and the stall limit, then try again".
impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let started = Instant::now();
        loop {
            match self.stream.write(buf) {
                Err(e) if is_timeout(&e) => {
                    if self.stop.is_triggered() {
                        return Err(io::Error::new(ErrorKind::ConnectionAborted, "shutdown requested"));
                    }
                    if let Some(limit) = self.write_limit {
                        if started.elapsed() >= limit {
                            trace!(connection = %self.id, "write stalled");
                            return Err(io::Error::new(
                                ErrorKind::TimedOut,
                                format!("peer stopped reading for {} ms", limit.as_millis()),
                            ));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PrepareDiskPayload, UpdateDataPayload};
    use crate::user_id::UserId;
    use crossbeam_channel::bounded;
    use std::net::TcpListener;

    /// Hands out its bytes a few at a time, then a timeout, then EOF
    struct Trickle {
        data: Vec<u8>,
        at: usize,
        step: usize,
        timed_out: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(io::Error::new(ErrorKind::WouldBlock, "deadline"));
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.at);
            buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
            self.at += n;
            Ok(n)
        }
    }

    fn packets() -> Vec<Packet> {
        let user = UserId::new();
        vec![
            Packet::prepare_disk(user, &PrepareDiskPayload { disk_size_mib: 1 }),
            Packet::update_data(
                user,
                &UpdateDataPayload {
                    total: 3,
                    offset: 0,
                    path: "f".to_string(),
                    data: b"abc".to_vec(),
                },
            )
            .unwrap(),
            Packet::pull_data(user),
        ]
    }

    #[test]
    fn test_read_loop_forwards_packets_in_order() {
        let sent = packets();
        let mut source = Trickle {
            data: sent.iter().flat_map(|p| p.encode()).collect(),
            at: 0,
            step: 7,
            timed_out: false,
        };
        let (tx, rx) = bounded(16);

        let reason = read_loop(&mut source, "peer", 5, &tx, &Shutdown::new());
        assert!(matches!(reason, CloseReason::Eof));

        let got: Vec<Packet> = rx
            .try_iter()
            .map(|item| match item {
                Inbound::Transaction(t) => {
                    assert_eq!(t.source, "peer");
                    t.packet
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(got, sent);
    }

    #[test]
    fn test_read_loop_stops_on_bad_version() {
        let mut bytes = packets()[2].encode();
        bytes[0] = 3;
        let (tx, _rx) = bounded(1);
        let reason = read_loop(&mut io::Cursor::new(bytes), "peer", 64, &tx, &Shutdown::new());
        assert!(matches!(
            reason,
            CloseReason::Framing(FrameError::UnsupportedProtocolVersion { .. })
        ));
    }

    #[test]
    fn test_full_queue_yields_to_shutdown() {
        let bytes: Vec<u8> = packets().iter().flat_map(|p| p.encode()).collect();
        let (tx, _rx) = bounded(1);
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.trigger();
        });

        let reason = read_loop(&mut io::Cursor::new(bytes), "peer", 1024, &tx, &shutdown);
        trigger.join().unwrap();
        assert!(matches!(reason, CloseReason::Shutdown));
    }

    #[test]
    fn test_reader_thread_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let (tx, rx) = bounded(16);
        let mut connection = Connection::new(accepted).unwrap();
        connection
            .spawn_reader(tx, Shutdown::new(), ReadOptions::default())
            .unwrap();

        let packet = packets().remove(0);
        client.write_all(&packet.encode()).unwrap();
        drop(client);

        let timeout = Duration::from_secs(5);
        match rx.recv_timeout(timeout).unwrap() {
            Inbound::Transaction(t) => assert_eq!(t.packet, packet),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv_timeout(timeout).unwrap() {
            Inbound::Closed { source, reason } => {
                assert_eq!(source, connection.id());
                assert!(matches!(reason, CloseReason::Eof));
            }
            other => panic!("unexpected {other:?}"),
        }
        connection.close();
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (peer, accepted)
    }

    /// Keep writing until the socket refuses, returning that error
    fn write_until_error(connection: &mut Connection) -> io::Error {
        let chunk = vec![0u8; 1 << 20];
        let started = std::time::Instant::now();
        loop {
            if let Err(e) = connection.write_all(&chunk) {
                return e;
            }
            assert!(started.elapsed() < Duration::from_secs(30), "writes never blocked");
        }
    }

    #[test]
    fn test_child_sees_parent_trigger() {
        let parent = Shutdown::new();
        let child = parent.child();
        child.trigger();
        assert!(!parent.is_triggered());

        let other = parent.child();
        parent.trigger();
        assert!(other.is_triggered());
    }

    #[test]
    fn test_close_does_not_wait_on_full_queue() {
        let (peer, accepted) = socket_pair();
        let (tx, rx) = bounded(1);
        tx.send(Inbound::Closed {
            source: "filler".to_string(),
            reason: CloseReason::Eof,
        })
        .unwrap();

        let mut connection = Connection::new(accepted).unwrap();
        connection
            .spawn_reader(tx, Shutdown::new(), ReadOptions::default())
            .unwrap();
        // reader hits EOF and blocks posting Closed onto the full queue
        drop(peer);
        thread::sleep(Duration::from_millis(100));

        let (done_tx, done_rx) = bounded(1);
        let closer = thread::spawn(move || {
            connection.close();
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
            "close waited on the inbound queue"
        );
        closer.join().unwrap();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_write_to_stalled_peer_times_out() {
        let (_peer, accepted) = socket_pair();
        let mut connection = Connection::new(accepted).unwrap();
        connection.set_write_limit(Some(Duration::from_millis(300)));

        let err = write_until_error(&mut connection);
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_blocked_write_observes_shutdown() {
        let (_peer, accepted) = socket_pair();
        let (tx, _rx) = bounded(16);
        let shutdown = Shutdown::new();
        let mut connection = Connection::new(accepted).unwrap();
        connection
            .spawn_reader(tx, shutdown.clone(), ReadOptions::default())
            .unwrap();

        let stopper = shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            stopper.trigger();
        });
        let err = write_until_error(&mut connection);
        trigger.join().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
    }
}
