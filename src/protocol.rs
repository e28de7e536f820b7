//! Shared protocol constants for the sdisk framed transport

// Protocol header constants
pub const VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 21;
pub const ID_SIZE: usize = 16;

// Largest payload the u16 length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

// total | offset | path_len, ahead of the path and file data in UPDATE_DATA
pub const UPDATE_DATA_FIXED_SIZE: usize = 24;
pub const PREPARE_DISK_SIZE: usize = 8;

// Opcode IDs (keep numeric stable, they are the wire format)
pub mod opcode {
    pub const PREPARE_DISK: u8 = 0;
    pub const UPDATE_DATA: u8 = 1;
    pub const PULL_DATA: u8 = 2;
}

// Payload encodings. Only NONE is produced or accepted today.
pub mod encoding {
    pub const NONE: u8 = 0;
}

// Sizing defaults for reads, queues and frames
pub mod defaults {
    pub const HOST: &str = "localhost";
    pub const PORT: u16 = 10000;

    // Bytes requested per socket read
    pub const READ_CHUNK_SIZE: usize = 10 * 1024;

    // Ring buffer holds this many read chunks before it has to grow
    pub const RING_MULTIPLIER: usize = 10;

    // Frame size the client chunker targets
    pub const MAX_FRAME_SIZE: usize = 10 * 1024;

    pub const MAX_CONNECTIONS: usize = 10;
    pub const MAX_QUEUED_CONNECTIONS: usize = MAX_CONNECTIONS;
    pub const MAX_QUEUED_TRANSACTIONS: usize = 36;
    pub const MAX_QUEUED_CLIENT_PACKETS: usize = 1000;
}

// Centralized timeout constants
pub mod timeouts {
    // Socket read deadline; expiry is where the read loop checks for shutdown (ms)
    pub const READ_MS: u64 = 300;

    // How long a blocked queue push waits before re-checking shutdown (ms)
    pub const QUEUE_PUSH_MS: u64 = 300;

    // Dispatcher wakes at least this often to observe shutdown (ms)
    pub const DISPATCH_TICK_MS: u64 = 100;

    // Socket write deadline; expiry is where a blocked write checks for shutdown (ms)
    pub const WRITE_POLL_MS: u64 = 100;

    // Server gives up on a peer that accepts no reply bytes for this long (ms)
    pub const WRITE_STALL_MS: u64 = 5000;

    // Accept loop poll interval while the listener has nothing pending (ms)
    pub const ACCEPT_POLL_MS: u64 = 50;
}

// Source identity used for transactions that did not arrive over a socket
pub const LOCAL_SOURCE: &str = "local";
