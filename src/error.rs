//! Error taxonomy for the codec, the transport and the disk handlers

use std::path::PathBuf;

/// Framing errors raised while turning bytes into packets
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported protocol version {received} (supported: {supported})")]
    UnsupportedProtocolVersion { received: u8, supported: u8 },

    #[error("unexpected header length {received} (need {expected})")]
    UnexpectedHeaderLength { received: usize, expected: usize },

    #[error("incomplete packet: need {needed} bytes, have {available}")]
    IncompletePacket { needed: usize, available: usize },

    #[error("payload of {0} bytes does not fit the u16 length field")]
    PayloadTooLarge(usize),

    #[error("path is not valid UTF-8")]
    InvalidPath,

    #[error("payload encoding {0} is not supported")]
    UnsupportedEncoding(u8),

    #[error("opcode {0} is unknown")]
    UnknownOpcode(u8),
}

/// Everything else: resource, disk and transport failures
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("maximum clients reached ({0})")]
    MaximumClientsReached(usize),

    #[error("user {0} has no disk")]
    UserHasNoDisk(String),

    #[error("user {0} already has a disk")]
    DiskAlreadyExists(String),

    #[error("unexpected file state for {path:?}: expected offset {expected}, landed at {actual}")]
    UnexpectedFileState {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("chunk at offset {offset} with {len} bytes exceeds file size {total}")]
    ChunkOutOfBounds { offset: u64, len: u64, total: u64 },

    #[error("path {0:?} escapes the disk root")]
    PathEscapesRoot(String),

    #[error("no active connection named {0}")]
    UnknownConnection(String),

    #[error("frame size {max_frame_size} leaves no room for data with a {path_len}-byte path")]
    FrameTooSmall { max_frame_size: usize, path_len: usize },

    #[error("invalid user id {0:?}")]
    InvalidUserId(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("server is no longer running")]
    ServerStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;
