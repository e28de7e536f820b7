//! Shared CLI definitions for `sdiskd` and `sdisk`, and their merge with
//! the config file

use crate::config::{
    resolve_sync_root, ClientConfig, FileConfig, ServerConfig, ENV_CONFIG, ENV_DISK_ROOT, ENV_HOME,
};
use crate::error::{Result, SyncError};
use crate::user_id::UserId;
use crate::verify::ChecksumType;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Options for the sync server
#[derive(Clone, Debug, Parser)]
#[command(name = "sdiskd", version, about = "sdisk sync server")]
pub struct DaemonOpts {
    /// TOML config file with a [server] table
    #[arg(long, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Host to bind (default: localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (default: 10000)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding one disk root per user
    #[arg(long, env = ENV_DISK_ROOT)]
    pub root: Option<PathBuf>,

    /// Provision a disk for this user id at startup (repeatable)
    #[arg(long = "prepare", value_name = "UUID", action = ArgAction::Append)]
    pub prepare: Vec<UserId>,

    /// Advertised size for disks created with --prepare
    #[arg(long = "disk-size", value_name = "MiB", default_value_t = 0)]
    pub disk_size: u64,

    /// Maximum simultaneous client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    /// Flags (and their env fallbacks) over the `[server]` table over defaults
    pub fn server_config(&self, file: &FileConfig) -> Result<ServerConfig> {
        let mut section = file.server.clone();
        if let Some(host) = &self.host {
            section.host = host.clone();
        }
        if let Some(port) = self.port {
            section.port = port;
        }
        if let Some(max) = self.max_connections {
            section.max_connections = max;
        }
        let root = self
            .root
            .clone()
            .or_else(|| section.disk_root.clone())
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!(
                    "no disk root: pass --root, set {ENV_DISK_ROOT} or [server].disk_root"
                ))
            })?;

        let config = ServerConfig::from_section(&section, root);
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Push the local folder, then pull everything stored on the server
    Sync,
    /// Push the local folder only
    Push,
    /// Compare the local folder with another directory by content
    Verify {
        other: PathBuf,
        /// blake3 or md5
        #[arg(long, default_value = "blake3")]
        checksum: ChecksumType,
    },
    /// Print a fresh user id
    NewId,
}

/// Options for the sync client
#[derive(Clone, Debug, Parser)]
#[command(name = "sdisk", version, about = "sdisk sync client")]
pub struct ClientOpts {
    /// TOML config file with a [client] table
    #[arg(long, env = ENV_CONFIG, global = true)]
    pub config: Option<PathBuf>,

    /// Server host (default: localhost)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server port (default: 10000)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Base directory for a relative --folder
    #[arg(long, env = ENV_HOME, global = true)]
    pub home: Option<PathBuf>,

    /// Sync folder
    #[arg(short, long, global = true)]
    pub folder: Option<PathBuf>,

    /// User id (hyphenated UUID)
    #[arg(short, long, global = true)]
    pub user: Option<UserId>,

    /// Largest frame this client sends
    #[arg(long, global = true)]
    pub max_frame_size: Option<usize>,

    /// Stop after this many seconds without an inbound packet
    #[arg(long, global = true)]
    pub idle_exit: Option<u64>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl ClientOpts {
    pub fn sync_root(&self, file: &FileConfig) -> Result<PathBuf> {
        let folder = self
            .folder
            .clone()
            .or_else(|| file.client.folder.clone())
            .ok_or_else(|| {
                SyncError::InvalidConfig("no sync folder: pass --folder or set [client].folder".into())
            })?;
        Ok(resolve_sync_root(self.home.as_deref(), &folder))
    }

    pub fn user(&self, file: &FileConfig) -> Result<UserId> {
        if let Some(user) = self.user {
            return Ok(user);
        }
        match &file.client.user_id {
            Some(id) => id.parse(),
            None => Err(SyncError::InvalidConfig(
                "no user id: pass --user or set [client].user_id (see `sdisk new-id`)".into(),
            )),
        }
    }

    /// Flags (and their env fallbacks) over the `[client]` table over defaults
    pub fn client_config(&self, file: &FileConfig) -> Result<ClientConfig> {
        let host = self.host.as_deref().unwrap_or(&file.client.host);
        let port = self.port.unwrap_or(file.client.port);

        let mut config = ClientConfig::new(format!("{host}:{port}"), self.sync_root(file)?, self.user(file)?);
        config.max_frame_size = self.max_frame_size.unwrap_or(file.client.max_frame_size);
        config.idle_exit = self
            .idle_exit
            .or(file.client.idle_exit_secs)
            .map(Duration::from_secs);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    #[test]
    fn test_daemon_flags_override_file() {
        let file = FileConfig::parse("[server]\nport = 7000\nmax_connections = 3\ndisk_root = \"/srv/a\"\n").unwrap();
        let opts = DaemonOpts::try_parse_from([
            "sdiskd", "--port", "7100", "--root", "/srv/b", "--prepare", USER, "--prepare", USER,
        ])
        .unwrap();

        let config = opts.server_config(&file).unwrap();
        assert_eq!(config.bind, "localhost:7100");
        assert_eq!(config.disk_root, PathBuf::from("/srv/b"));
        assert_eq!(config.max_connections, 3);
        assert_eq!(opts.prepare.len(), 2);
        assert_eq!(opts.prepare[0].to_string(), USER);
    }

    #[test]
    fn test_daemon_without_root_is_rejected() {
        let opts = DaemonOpts {
            config: None,
            host: None,
            port: None,
            root: None,
            prepare: Vec::new(),
            disk_size: 0,
            max_connections: None,
            verbose: false,
        };
        let err = opts.server_config(&FileConfig::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_prepare_id_fails_to_parse() {
        assert!(DaemonOpts::try_parse_from(["sdiskd", "--prepare", "nope"]).is_err());
    }

    #[test]
    fn test_client_merges_flags_and_file() {
        let file = FileConfig::parse(&format!(
            "[client]\nport = 9000\nfolder = \"/data/sync\"\nuser_id = \"{USER}\"\nidle_exit_secs = 5\n"
        ))
        .unwrap();
        let opts = ClientOpts::try_parse_from(["sdisk", "sync", "--host", "10.0.0.2"]).unwrap();

        let config = opts.client_config(&file).unwrap();
        assert_eq!(config.server, "10.0.0.2:9000");
        assert_eq!(config.sync_root, PathBuf::from("/data/sync"));
        assert_eq!(config.user.to_string(), USER);
        assert_eq!(config.idle_exit, Some(Duration::from_secs(5)));
        assert!(matches!(opts.command, Command::Sync));
    }

    #[test]
    fn test_client_needs_a_user() {
        let opts = ClientOpts::try_parse_from(["sdisk", "push", "--folder", "/tmp/x"]).unwrap();
        let err = opts.client_config(&FileConfig::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn test_verify_takes_a_checksum_type() {
        let opts = ClientOpts::try_parse_from(["sdisk", "verify", "/other", "--checksum", "md5"]).unwrap();
        match opts.command {
            Command::Verify { other, checksum } => {
                assert_eq!(other, PathBuf::from("/other"));
                assert_eq!(checksum, ChecksumType::Md5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
