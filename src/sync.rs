//! Client sync engine and the file chunker it shares with the server.
//!
//! A file of `total` bytes travels as `ceil(total / chunk)` UpdateData
//! packets, where `chunk = max_frame - HEADER_SIZE - 24 - path_len`, so
//! every frame fits the configured maximum. Each packet carries its absolute
//! offset, so the receiver can apply chunks in any order.

use crate::config::ClientConfig;
use crate::connection::{CloseReason, Connection, Inbound, Shutdown};
use crate::disk::apply_update;
use crate::error::{Result, SyncError};
use crate::fs_enum::{enumerate_files, LocalFile};
use crate::packet::{Message, Packet, UpdateDataPayload};
use crate::paths::ensure_dir_exists;
use crate::protocol::{timeouts, HEADER_SIZE, UPDATE_DATA_FIXED_SIZE};
use crate::user_id::UserId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Data bytes that fit in one UpdateData frame for a path of `path_len` bytes
pub fn chunk_size(max_frame_size: usize, path_len: usize) -> Result<usize> {
    let overhead = HEADER_SIZE + UPDATE_DATA_FIXED_SIZE + path_len;
    match max_frame_size.checked_sub(overhead) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(SyncError::FrameTooSmall {
            max_frame_size,
            path_len,
        }),
    }
}

/// Number of packets a file of `total` bytes is sent as.
/// An empty file still gets one (empty) chunk so it exists remotely.
pub fn chunk_count(total: u64, chunk_size: usize) -> u64 {
    if total == 0 {
        1
    } else {
        total.div_ceil(chunk_size as u64)
    }
}

/// Splits one file into UpdateData packets, reading sequentially from `source`
pub struct FileChunker<R> {
    source: R,
    user: UserId,
    path: String,
    total: u64,
    chunk_size: usize,
    offset: u64,
    remaining: u64,
}

impl<R: Read> FileChunker<R> {
    pub fn new(
        source: R,
        user: UserId,
        path: impl Into<String>,
        total: u64,
        max_frame_size: usize,
    ) -> Result<Self> {
        let path = path.into();
        let chunk_size = chunk_size(max_frame_size, path.len())?;
        Ok(FileChunker {
            source,
            user,
            total,
            chunk_size,
            offset: 0,
            remaining: chunk_count(total, chunk_size),
            path,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<R: Read> Iterator for FileChunker<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        // Never read past `total`, even if the file grew since it was listed
        let want = (self.total - self.offset).min(self.chunk_size as u64);
        let mut data = Vec::with_capacity(want as usize);
        if let Err(e) = (&mut self.source).take(want).read_to_end(&mut data) {
            self.remaining = 0;
            return Some(Err(e.into()));
        }
        if data.is_empty() && want > 0 {
            // file shrank underneath us
            self.remaining = 0;
            return None;
        }

        let payload = UpdateDataPayload {
            total: self.total,
            offset: self.offset,
            path: self.path.clone(),
            data,
        };
        self.offset += payload.data.len() as u64;
        Some(Packet::update_data(self.user, &payload).map_err(SyncError::from))
    }
}

/// Counters for one sync run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub files_sent: u64,
    pub files_skipped: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub chunks_applied: u64,
    pub bytes_applied: u64,
}

/// Send every file in `files` to `out` as UpdateData packets.
/// Files that can no longer be opened, or whose path leaves no room for data
/// in a frame, are skipped; write errors abort.
pub fn send_files<W: Write>(
    out: &mut W,
    files: &[LocalFile],
    user: UserId,
    max_frame_size: usize,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    for file in files {
        if let Err(e) = chunk_size(max_frame_size, file.relative.len()) {
            warn!(path = %file.relative, error = %e, "skipping file");
            report.files_skipped += 1;
            continue;
        }
        let source = match File::open(&file.path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "skipping file");
                report.files_skipped += 1;
                continue;
            }
        };
        let chunker = FileChunker::new(source, user, file.relative.as_str(), file.size, max_frame_size)?;
        for packet in chunker {
            let packet = packet?;
            out.write_all(&packet.encode())?;
            let data_len = packet.payload().len() - UPDATE_DATA_FIXED_SIZE - file.relative.len();
            report.chunks_sent += 1;
            report.bytes_sent += data_len as u64;
        }
        trace!(path = %file.relative, size = file.size, "file sent");
        report.files_sent += 1;
    }
    out.flush()?;

    Ok(report)
}

/// A connected sync client.
pub struct Client {
    config: ClientConfig,
    // Declared before `connection` so it drops first: a reader blocked on a
    // full queue then sees the receiver vanish and exits before the join.
    inbound: Receiver<Inbound>,
    connection: Connection,
    shutdown: Shutdown,
}

impl Client {
    pub fn connect(config: ClientConfig, shutdown: Shutdown) -> Result<Self> {
        config.validate()?;
        ensure_dir_exists(&config.sync_root)?;

        let stream = TcpStream::connect(&config.server)?;
        let mut connection = Connection::new(stream)?;
        let (tx, rx) = bounded(config.max_queued_packets);
        connection.spawn_reader(tx, shutdown.clone(), config.read)?;

        info!(
            server = %config.server,
            user = %config.user,
            root = %config.sync_root.display(),
            "connected"
        );
        Ok(Client {
            config,
            inbound: rx,
            connection,
            shutdown,
        })
    }

    /// Walk the sync root and send every file
    pub fn push(&mut self) -> Result<SyncReport> {
        let files = enumerate_files(&self.config.sync_root)?;
        debug!(files = files.len(), "sending local files");
        send_files(
            &mut self.connection,
            &files,
            self.config.user,
            self.config.max_frame_size,
        )
    }

    /// Ask the server to send back everything stored for this user
    pub fn request_pull(&mut self) -> Result<()> {
        self.connection.send(&Packet::pull_data(self.config.user))?;
        Ok(())
    }

    /// Apply inbound UpdateData packets under the sync root until the server
    /// closes the connection, shutdown is triggered, or the idle limit passes.
    pub fn drain(&mut self, report: &mut SyncReport) -> Result<()> {
        let tick = Duration::from_millis(timeouts::DISPATCH_TICK_MS);
        let mut last_packet = Instant::now();

        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            if let Some(idle) = self.config.idle_exit {
                if last_packet.elapsed() >= idle {
                    debug!(idle_ms = idle.as_millis() as u64, "no inbound packets, stopping");
                    return Ok(());
                }
            }

            match self.inbound.recv_timeout(tick) {
                Ok(Inbound::Transaction(t)) => {
                    last_packet = Instant::now();
                    if let Err(e) = self.apply(&t.packet, report) {
                        warn!(error = %e, "failed to apply packet");
                    }
                }
                Ok(Inbound::Closed { reason, .. }) => {
                    info!(reason = %reason, "server connection closed");
                    return match reason {
                        CloseReason::Framing(e) => Err(e.into()),
                        CloseReason::Io(e) => Err(e.into()),
                        _ => Ok(()),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    fn apply(&self, packet: &Packet, report: &mut SyncReport) -> Result<()> {
        match packet.message()? {
            Message::UpdateData(update) => {
                let path = apply_update(&self.config.sync_root, &update)?;
                trace!(path = %path.display(), offset = update.offset, "chunk applied");
                report.chunks_applied += 1;
                report.bytes_applied += update.data.len() as u64;
            }
            Message::PrepareDisk(_) | Message::PullData => {
                debug!(opcode = packet.header().opcode, "ignoring packet");
            }
        }
        Ok(())
    }

    /// Startup sequence: push everything, request a pull, drain replies
    pub fn run(mut self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = self.push()?;
        info!(
            files = report.files_sent,
            chunks = report.chunks_sent,
            bytes = report.bytes_sent,
            "local files sent"
        );

        self.request_pull()?;
        self.drain(&mut report)?;

        info!(
            chunks = report.chunks_applied,
            bytes = report.bytes_applied,
            seconds = started.elapsed().as_secs_f64(),
            "sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembler::Reassembler;
    use std::io::Cursor;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn reassemble(bytes: &[u8]) -> Vec<UpdateDataPayload> {
        let mut reassembler = Reassembler::new(64 * 1024);
        let mut out = Vec::new();
        for chunk in bytes.chunks(64 * 1024) {
            for packet in reassembler.feed(chunk) {
                match packet.unwrap().message().unwrap() {
                    Message::UpdateData(update) => out.push(update),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        out
    }

    #[test]
    fn test_chunk_size_accounts_for_overhead() {
        assert_eq!(chunk_size(10_240, 9).unwrap(), 10_240 - 21 - 24 - 9);
        assert!(matches!(
            chunk_size(50, 5),
            Err(SyncError::FrameTooSmall { .. })
        ));
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
    }

    #[test]
    fn test_ten_mib_file_at_1000_byte_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = pattern(10 * 1024 * 1024);
        std::fs::write(tmp.path().join("big.bin"), &contents).unwrap();
        let files = enumerate_files(tmp.path()).unwrap();
        let max_frame = 1000 + HEADER_SIZE + UPDATE_DATA_FIXED_SIZE + "big.bin".len();

        let mut wire = Vec::new();
        let report = send_files(&mut wire, &files, UserId::new(), max_frame).unwrap();

        let expected = (10 * 1024 * 1024u64).div_ceil(1000);
        assert_eq!(report.chunks_sent, expected);

        let updates = reassemble(&wire);
        assert_eq!(updates.len() as u64, expected);
        assert!(updates.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(updates.iter().all(|u| u.total == contents.len() as u64));
        assert!(updates.iter().all(|u| u.path == "big.bin"));

        let rebuilt: Vec<u8> = updates.iter().flat_map(|u| u.data.iter().copied()).collect();
        assert_eq!(rebuilt, contents);
    }

    #[test]
    fn test_every_frame_respects_the_limit() {
        let max_frame = 200;
        let chunker =
            FileChunker::new(Cursor::new(pattern(1234)), UserId::new(), "a/b.txt", 1234, max_frame).unwrap();
        for packet in chunker {
            assert!(packet.unwrap().encode().len() <= max_frame);
        }
    }

    #[test]
    fn test_empty_file_sends_one_empty_chunk() {
        let chunker = FileChunker::new(Cursor::new(Vec::new()), UserId::new(), "empty", 0, 100).unwrap();
        let packets: Vec<_> = chunker.collect::<Result<_>>().unwrap();
        assert_eq!(packets.len(), 1);
        match packets[0].message().unwrap() {
            Message::UpdateData(u) => {
                assert_eq!((u.total, u.offset), (0, 0));
                assert!(u.data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_shrunken_source_stops_early() {
        // listed as 500 bytes, only 150 readable
        let chunker =
            FileChunker::new(Cursor::new(pattern(150)), UserId::new(), "f", 500, 100).unwrap();
        let packets: Vec<_> = chunker.collect::<Result<_>>().unwrap();
        let sent: usize = packets
            .iter()
            .map(|p| match p.message().unwrap() {
                Message::UpdateData(u) => u.data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(sent, 150);
    }

    #[test]
    fn test_long_path_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let long_name = "n".repeat(200);
        std::fs::write(tmp.path().join(&long_name), b"unsendable").unwrap();
        std::fs::write(tmp.path().join("z.txt"), b"fine").unwrap();
        let files = enumerate_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 2);

        let mut wire = Vec::new();
        let report = send_files(&mut wire, &files, UserId::new(), 128).unwrap();
        assert_eq!(report.files_sent, 1);
        assert_eq!(report.files_skipped, 1);

        let updates = reassemble(&wire);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, "z.txt");
        assert_eq!(updates[0].data, b"fine");
    }

    #[test]
    fn test_chunks_round_trip_through_apply_update() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/data.bin"), pattern(5000)).unwrap();
        std::fs::write(src.path().join("empty.txt"), b"").unwrap();

        let files = enumerate_files(src.path()).unwrap();
        let mut wire = Vec::new();
        send_files(&mut wire, &files, UserId::new(), 512).unwrap();

        // apply newest-first to show order does not matter
        for update in reassemble(&wire).iter().rev() {
            apply_update(dst.path(), update).unwrap();
        }
        assert_eq!(std::fs::read(dst.path().join("nested/data.bin")).unwrap(), pattern(5000));
        assert_eq!(std::fs::read(dst.path().join("empty.txt")).unwrap(), b"");
    }
}
