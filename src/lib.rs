//! sdisk: per-user file synchronisation over a small binary TCP protocol
//!
//! A server keeps one disk root per user and accepts three kinds of
//! packets: PrepareDisk, UpdateData (an offset-addressed file chunk) and
//! PullData (stream everything back). Clients push their local folder and
//! pull the server's copy.

pub mod cli;
pub mod config;
pub mod connection;
pub mod disk;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod packet;
pub mod paths;
pub mod protocol;
pub mod reassembler;
pub mod ring;
pub mod server;
pub mod sync;
pub mod user_id;
pub mod verify;

pub use config::{ClientConfig, FileConfig, ServerConfig};
pub use connection::Shutdown;
pub use error::{FrameError, Result, SyncError};
pub use packet::{Message, Opcode, Packet, PacketHeader};
pub use server::{Server, ServerHandle};
pub use sync::{Client, SyncReport};
pub use user_id::UserId;
