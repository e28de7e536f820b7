use crate::error::SyncError;
use crate::protocol::ID_SIZE;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque 16-byte user identifier carried in every packet header.
/// Its canonical string form is the hyphenated UUID, which also names the
/// user's disk root on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        UserId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        UserId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for UserId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(UserId)
            .map_err(|_| SyncError::InvalidUserId(s.to_string()))
    }
}
