//! Metadata record codec.
//!
//! A record is a 48-byte little-endian header followed by an optional
//! NUL-terminated payload:
//!
//! ```text
//!  0      2    3         8     12    16      24      32      40     48
//!  +------+----+---------+-----+-----+-------+-------+-------+------+--------------+
//!  | mode |kind| reserved| uid | gid | atime | mtime | ctime | size | payload\0 .. |
//!  +------+----+---------+-----+-----+-------+-------+-------+------+--------------+
//! ```
//!
//! Regular files may carry the backing path relative to the store root,
//! symlinks carry their stored target, directories carry nothing.

pub const HEADER_LEN: usize = 48;

const KIND_OFFSET: usize = 2;
const RESERVED: std::ops::Range<usize> = 3..8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Regular,
    Directory,
    Symlink,
}

impl Kind {
    pub fn tag(self) -> u8 {
        match self {
            Kind::Regular => b'f',
            Kind::Directory => b'd',
            Kind::Symlink => b'l',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Kind> {
        match tag {
            b'f' => Some(Kind::Regular),
            b'd' => Some(Kind::Directory),
            b'l' => Some(Kind::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record is {0} bytes, shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),
    #[error("unknown kind tag {0:#04x}")]
    UnknownKind(u8),
    #[error("payload is not NUL-terminated")]
    UnterminatedPayload,
    #[error("payload contains an interior NUL at byte {0}")]
    InteriorNul(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: Kind,
    /// Permission bits only; the file-type bits come from `kind`.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    /// Header padding. Writers do not always zero it, so it is carried
    /// through as found.
    pub reserved: [u8; 5],
    pub payload: Option<Vec<u8>>,
}

impl Record {
    pub fn decode(bytes: &[u8]) -> Result<Record, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }
        let (header, tail) = bytes.split_at(HEADER_LEN);
        let kind = Kind::from_tag(header[KIND_OFFSET])
            .ok_or(DecodeError::UnknownKind(header[KIND_OFFSET]))?;

        let payload = match tail.split_last() {
            None => None,
            Some((&0, body)) => {
                if let Some(pos) = body.iter().position(|&b| b == 0) {
                    return Err(DecodeError::InteriorNul(HEADER_LEN + pos));
                }
                Some(body.to_vec())
            }
            Some(_) => return Err(DecodeError::UnterminatedPayload),
        };

        Ok(Record {
            kind,
            mode: u16::from_le_bytes(field(header, 0)),
            uid: u32::from_le_bytes(field(header, 8)),
            gid: u32::from_le_bytes(field(header, 12)),
            atime: u64::from_le_bytes(field(header, 16)),
            mtime: u64::from_le_bytes(field(header, 24)),
            ctime: u64::from_le_bytes(field(header, 32)),
            size: u64::from_le_bytes(field(header, 40)),
            reserved: field(header, RESERVED.start),
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len() + 1);
        let mut out = Vec::with_capacity(HEADER_LEN + payload_len);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.push(self.kind.tag());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.atime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
            out.push(0);
        }
        out
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Kind::Directory
    }
}

fn field<const N: usize>(header: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&header[offset..offset + N]);
    buf
}
