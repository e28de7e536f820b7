//! Runtime configuration for the server and the client.
//!
//! Values come from, in order of precedence: command-line flags, the
//! `SDISK_*` environment variables, an optional TOML file, then the
//! defaults in [`crate::protocol::defaults`]. The CLI layer does the
//! merging; this module owns the file format and validation.

use crate::connection::ReadOptions;
use crate::error::{Result, SyncError};
use crate::protocol::{defaults, timeouts, HEADER_SIZE, MAX_FRAME_SIZE, UPDATE_DATA_FIXED_SIZE};
use crate::user_id::UserId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DISK_ROOT: &str = "SDISK_ROOT";
pub const ENV_HOME: &str = "SDISK_HOME";
pub const ENV_CONFIG: &str = "SDISK_CONFIG";

// ── File format ──────────────────────────────────────────────────────────────

/// Contents of the optional `sdisk.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub disk_root: Option<PathBuf>,
    pub max_connections: usize,
    pub max_queued_connections: usize,
    pub max_queued_transactions: usize,
    pub read_chunk_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            disk_root: None,
            max_connections: defaults::MAX_CONNECTIONS,
            max_queued_connections: defaults::MAX_QUEUED_CONNECTIONS,
            max_queued_transactions: defaults::MAX_QUEUED_TRANSACTIONS,
            read_chunk_size: defaults::READ_CHUNK_SIZE,
            read_timeout_ms: timeouts::READ_MS,
            write_timeout_ms: timeouts::WRITE_STALL_MS,
            max_frame_size: defaults::MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub host: String,
    pub port: u16,
    /// Sync folder, relative to `SDISK_HOME` unless absolute
    pub folder: Option<PathBuf>,
    pub user_id: Option<String>,
    pub max_frame_size: usize,
    pub idle_exit_secs: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        ClientSection {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            folder: None,
            user_id: None,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            idle_exit_secs: None,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| SyncError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load `path` if given, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

// ── Runtime configs ──────────────────────────────────────────────────────────

/// Reject frame sizes that leave no room for data or overflow the u16 length field
pub fn validate_frame_size(size: usize) -> Result<()> {
    let min = HEADER_SIZE + UPDATE_DATA_FIXED_SIZE;
    if size <= min || size > MAX_FRAME_SIZE {
        return Err(SyncError::InvalidConfig(format!(
            "max frame size {size} must be in ({min}, {MAX_FRAME_SIZE}]"
        )));
    }
    Ok(())
}

fn require_nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(SyncError::InvalidConfig(format!("{name} must be greater than zero")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub disk_root: PathBuf,
    pub max_connections: usize,
    pub max_queued_connections: usize,
    pub max_queued_transactions: usize,
    pub read: ReadOptions,
    /// A PullData reply is abandoned when the peer reads nothing for this long
    pub write_timeout: Duration,
    /// Frame size used when replying to PullData
    pub max_frame_size: usize,
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>, disk_root: impl Into<PathBuf>) -> Self {
        ServerConfig {
            bind: bind.into(),
            disk_root: disk_root.into(),
            max_connections: defaults::MAX_CONNECTIONS,
            max_queued_connections: defaults::MAX_QUEUED_CONNECTIONS,
            max_queued_transactions: defaults::MAX_QUEUED_TRANSACTIONS,
            read: ReadOptions::default(),
            write_timeout: Duration::from_millis(timeouts::WRITE_STALL_MS),
            max_frame_size: defaults::MAX_FRAME_SIZE,
        }
    }

    /// Build from the `[server]` table; `disk_root` must come from somewhere
    pub fn from_section(section: &ServerSection, disk_root: PathBuf) -> Self {
        ServerConfig {
            bind: format!("{}:{}", section.host, section.port),
            disk_root,
            max_connections: section.max_connections,
            max_queued_connections: section.max_queued_connections,
            max_queued_transactions: section.max_queued_transactions,
            read: ReadOptions {
                chunk_size: section.read_chunk_size,
                timeout: Duration::from_millis(section.read_timeout_ms),
            },
            write_timeout: Duration::from_millis(section.write_timeout_ms),
            max_frame_size: section.max_frame_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("max_connections", self.max_connections)?;
        require_nonzero("max_queued_connections", self.max_queued_connections)?;
        require_nonzero("max_queued_transactions", self.max_queued_transactions)?;
        require_nonzero("read_chunk_size", self.read.chunk_size)?;
        if self.read.timeout.is_zero() {
            return Err(SyncError::InvalidConfig("read timeout must be greater than zero".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(SyncError::InvalidConfig("write timeout must be greater than zero".into()));
        }
        validate_frame_size(self.max_frame_size)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub sync_root: PathBuf,
    pub user: UserId,
    pub max_frame_size: usize,
    pub read: ReadOptions,
    pub max_queued_packets: usize,
    /// Stop draining after this long without an inbound packet
    pub idle_exit: Option<Duration>,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, sync_root: impl Into<PathBuf>, user: UserId) -> Self {
        ClientConfig {
            server: server.into(),
            sync_root: sync_root.into(),
            user,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            read: ReadOptions::default(),
            max_queued_packets: defaults::MAX_QUEUED_CLIENT_PACKETS,
            idle_exit: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero("max_queued_packets", self.max_queued_packets)?;
        require_nonzero("read_chunk_size", self.read.chunk_size)?;
        validate_frame_size(self.max_frame_size)
    }
}

/// `{home}/{folder}`, or `folder` itself when it is absolute
pub fn resolve_sync_root(home: Option<&Path>, folder: &Path) -> PathBuf {
    match home {
        Some(home) if folder.is_relative() => home.join(folder),
        _ => folder.to_path_buf(),
    }
}
