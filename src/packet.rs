//! Packet codec: the fixed 21-byte header and the three payload kinds.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       1     opcode
//! 2       1     encoding
//! 3       16    user id
//! 19      2     payload length
//! 21      N     payload
//! ```
//!
//! Nothing in here touches a socket or the filesystem.

use crate::error::FrameError;
use crate::protocol::{
    encoding, opcode, HEADER_SIZE, ID_SIZE, MAX_PAYLOAD_SIZE, PREPARE_DISK_SIZE,
    UPDATE_DATA_FIXED_SIZE, VERSION,
};
use crate::user_id::UserId;

/// Which payload interpretation and handler applies to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    PrepareDisk,
    UpdateData,
    PullData,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            opcode::PREPARE_DISK => Ok(Opcode::PrepareDisk),
            opcode::UPDATE_DATA => Ok(Opcode::UpdateData),
            opcode::PULL_DATA => Ok(Opcode::PullData),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        match op {
            Opcode::PrepareDisk => opcode::PREPARE_DISK,
            Opcode::UpdateData => opcode::UPDATE_DATA,
            Opcode::PullData => opcode::PULL_DATA,
        }
    }
}

/// Fixed-size packet header.
///
/// The opcode is kept as the raw wire byte so that a header with an opcode
/// this build does not know still frames correctly; [`PacketHeader::opcode`]
/// does the checked conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub opcode: u8,
    pub encoding: u8,
    pub user: UserId,
    pub payload_len: u16,
}

impl PacketHeader {
    pub fn new(op: Opcode, user: UserId, payload_len: u16) -> Self {
        PacketHeader {
            version: VERSION,
            opcode: op.into(),
            encoding: encoding::NONE,
            user,
            payload_len,
        }
    }

    pub fn opcode(&self) -> Result<Opcode, FrameError> {
        Opcode::try_from(self.opcode)
    }

    /// Header plus payload, in bytes
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = self.version;
        header[1] = self.opcode;
        header[2] = self.encoding;
        header[3..3 + ID_SIZE].copy_from_slice(self.user.as_bytes());
        header[3 + ID_SIZE..HEADER_SIZE].copy_from_slice(&self.payload_len.to_be_bytes());
        header
    }

    /// Decode the first [`HEADER_SIZE`] bytes of `bytes`; anything after is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::UnexpectedHeaderLength {
                received: bytes.len(),
                expected: HEADER_SIZE,
            });
        }
        if bytes[0] != VERSION {
            return Err(FrameError::UnsupportedProtocolVersion {
                received: bytes[0],
                supported: VERSION,
            });
        }

        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&bytes[3..3 + ID_SIZE]);
        let payload_len = u16::from_be_bytes([bytes[3 + ID_SIZE], bytes[4 + ID_SIZE]]);

        Ok(PacketHeader {
            version: bytes[0],
            opcode: bytes[1],
            encoding: bytes[2],
            user: UserId::from_bytes(id),
            payload_len,
        })
    }
}

/// One complete protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(op: Opcode, user: UserId, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let header = PacketHeader::new(op, user, payload.len() as u16);
        Ok(Packet { header, payload })
    }

    pub fn prepare_disk(user: UserId, payload: &PrepareDiskPayload) -> Self {
        let payload = payload.encode().to_vec();
        Packet {
            header: PacketHeader::new(Opcode::PrepareDisk, user, payload.len() as u16),
            payload,
        }
    }

    pub fn update_data(user: UserId, payload: &UpdateDataPayload) -> Result<Self, FrameError> {
        Packet::new(Opcode::UpdateData, user, payload.encode())
    }

    pub fn pull_data(user: UserId) -> Self {
        Packet {
            header: PacketHeader::new(Opcode::PullData, user, 0),
            payload: Vec::new(),
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn user(&self) -> UserId {
        self.header.user
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one whole frame. Only unencoded payloads are accepted.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = PacketHeader::decode(bytes)?;
        if header.encoding != encoding::NONE {
            return Err(FrameError::UnsupportedEncoding(header.encoding));
        }
        let available = bytes.len() - HEADER_SIZE;
        let needed = header.payload_len as usize;
        if available < needed {
            return Err(FrameError::IncompletePacket { needed, available });
        }
        Ok(Packet {
            header,
            payload: bytes[HEADER_SIZE..HEADER_SIZE + needed].to_vec(),
        })
    }

    /// Interpret the payload according to the opcode
    pub fn message(&self) -> Result<Message, FrameError> {
        match self.header.opcode()? {
            Opcode::PrepareDisk => PrepareDiskPayload::decode(&self.payload).map(Message::PrepareDisk),
            Opcode::UpdateData => UpdateDataPayload::decode(&self.payload).map(Message::UpdateData),
            Opcode::PullData => Ok(Message::PullData),
        }
    }
}

/// A decoded payload; one variant per opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PrepareDisk(PrepareDiskPayload),
    UpdateData(UpdateDataPayload),
    PullData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareDiskPayload {
    pub disk_size_mib: u64,
}

impl PrepareDiskPayload {
    pub fn encode(&self) -> [u8; PREPARE_DISK_SIZE] {
        self.disk_size_mib.to_be_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let raw: [u8; PREPARE_DISK_SIZE] = data
            .get(..PREPARE_DISK_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(FrameError::IncompletePacket {
                needed: PREPARE_DISK_SIZE,
                available: data.len(),
            })?;
        Ok(PrepareDiskPayload {
            disk_size_mib: u64::from_be_bytes(raw),
        })
    }
}

/// One chunk of one file, addressed by its absolute offset in the file.
/// The path length on the wire is always `path.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDataPayload {
    pub total: u64,
    pub offset: u64,
    pub path: String,
    pub data: Vec<u8>,
}

impl UpdateDataPayload {
    pub fn path_len(&self) -> u64 {
        self.path.len() as u64
    }

    /// Size of the encoded payload
    pub fn encoded_len(&self) -> usize {
        UPDATE_DATA_FIXED_SIZE + self.path.len() + self.data.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.path_len().to_be_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < UPDATE_DATA_FIXED_SIZE {
            return Err(FrameError::IncompletePacket {
                needed: UPDATE_DATA_FIXED_SIZE,
                available: data.len(),
            });
        }
        let read_u64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let total = read_u64(0);
        let offset = read_u64(8);
        let path_len = read_u64(16);

        let rest = &data[UPDATE_DATA_FIXED_SIZE..];
        if path_len > rest.len() as u64 {
            return Err(FrameError::IncompletePacket {
                needed: UPDATE_DATA_FIXED_SIZE.saturating_add(path_len as usize),
                available: data.len(),
            });
        }
        let (path, file_data) = rest.split_at(path_len as usize);
        let path = std::str::from_utf8(path)
            .map_err(|_| FrameError::InvalidPath)?
            .to_string();

        Ok(UpdateDataPayload {
            total,
            offset,
            path,
            data: file_data.to_vec(),
        })
    }
}
