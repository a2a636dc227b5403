//! Read-only reader for GDBM database files.
//!
//! Only the lookup path is implemented: header, hash directory, buckets and
//! key/data records. Files are read with positioned reads; decoded buckets
//! are kept in a small LRU cache, which is why [`KvStore::fetch`] needs
//! `&mut self`.
//!
//! Supported: the standard format with 32-bit (`0x13579acd`) or 64-bit
//! (`0x13579acf`, legacy `0x13579ace`) file offsets in host byte order.

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;

use crate::kv::KvStore;

pub const MAGIC_LEGACY: u32 = 0x13579ace;
pub const MAGIC_32: u32 = 0x13579acd;
pub const MAGIC_64: u32 = 0x13579acf;
const MAGIC_NUMSYNC_32: u32 = 0x13579ad0;
const MAGIC_NUMSYNC_64: u32 = 0x13579ad1;

/// Width of the hash values stored in buckets.
pub const HASH_BITS: u32 = 31;
/// Bytes of each key kept inline in its bucket element.
pub const KEY_START: usize = 4;
/// Free-space entries at the head of every bucket.
pub const BUCKET_AVAIL: usize = 6;
/// Hash value of an unused bucket slot.
pub const EMPTY_SLOT: i32 = -1;

const BUCKET_CACHE: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(n) => n,
    None => unreachable!(),
};

/// The GDBM key hash.
///
/// Key bytes are sign-extended before shifting, matching builds where
/// `char` is signed.
pub fn hash(key: &[u8]) -> u32 {
    let mut value = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (index, &byte) in key.iter().enumerate() {
        let shift = (index * 5 % 24) as u32;
        let byte = byte as i8 as i32 as u32;
        value = value.wrapping_add(byte.wrapping_shl(shift)) & 0x7FFF_FFFF;
    }
    value.wrapping_mul(1_103_515_243).wrapping_add(12345) & 0x7FFF_FFFF
}

/// Struct layout for one offset width (`off_t` of the writing host).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub off: usize,
}

impl Layout {
    pub const OFF32: Layout = Layout { off: 4 };
    pub const OFF64: Layout = Layout { off: 8 };

    fn align(self, n: usize) -> usize {
        n.div_ceil(self.off) * self.off
    }

    pub fn header_dir(self) -> usize {
        8
    }

    pub fn header_dir_size(self) -> usize {
        8 + self.off
    }

    pub fn header_dir_bits(self) -> usize {
        12 + self.off
    }

    pub fn header_bucket_size(self) -> usize {
        16 + self.off
    }

    pub fn header_bucket_elems(self) -> usize {
        20 + self.off
    }

    pub fn header_next_block(self) -> usize {
        self.align(24 + self.off)
    }

    pub fn header_len(self) -> usize {
        self.header_next_block() + self.off
    }

    /// `{ int av_size; off_t av_adr; }`
    pub fn avail_elem_size(self) -> usize {
        2 * self.off
    }

    pub fn bucket_bits(self) -> usize {
        self.align(4) + BUCKET_AVAIL * self.avail_elem_size()
    }

    pub fn bucket_count(self) -> usize {
        self.bucket_bits() + 4
    }

    pub fn bucket_table(self) -> usize {
        self.align(self.bucket_count() + 4)
    }

    pub fn element_size(self) -> usize {
        self.align(16 + self.off)
    }

    pub fn element_key_size(self) -> usize {
        8 + self.off
    }

    pub fn element_data_size(self) -> usize {
        12 + self.off
    }

    fn read_off(self, buf: &[u8], at: usize) -> u64 {
        if self.off == 8 {
            u64::from_ne_bytes(array(buf, at))
        } else {
            u32::from_ne_bytes(array(buf, at)) as u64
        }
    }
}

fn array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes(array(buf, at))
}

/// Whether `len` bytes starting at `at` lie inside a file of `file_len` bytes.
fn within(at: u64, len: usize, file_len: u64) -> bool {
    at.checked_add(len as u64).is_some_and(|end| end <= file_len)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[derive(Debug, Clone)]
struct Header {
    layout: Layout,
    dir: u64,
    dir_bits: u32,
    bucket_size: usize,
    bucket_elems: usize,
}

#[derive(Debug, Clone)]
struct Element {
    hash: i32,
    key_start: [u8; KEY_START],
    data_pointer: u64,
    key_size: usize,
    data_size: usize,
}

#[derive(Debug)]
struct Bucket {
    elements: Vec<Element>,
}

pub struct GdbmFile {
    file: File,
    file_len: u64,
    header: Header,
    dir: Vec<u64>,
    buckets: LruCache<u64, Arc<Bucket>>,
}

impl std::fmt::Debug for GdbmFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GdbmFile")
            .field("file_len", &self.file_len)
            .field("dir", &self.header.dir)
            .field("dir_bits", &self.header.dir_bits)
            .field("bucket_elems", &self.header.bucket_elems)
            .finish()
    }
}

impl GdbmFile {
    /// Opens `path` read-only and validates its header and hash directory.
    pub fn open(path: impl AsRef<Path>) -> io::Result<GdbmFile> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact_at(&mut magic, 0)?;
        let layout = match u32::from_ne_bytes(magic) {
            MAGIC_64 | MAGIC_LEGACY => Layout::OFF64,
            MAGIC_32 => Layout::OFF32,
            MAGIC_NUMSYNC_32 | MAGIC_NUMSYNC_64 => {
                return Err(invalid("extended (numsync) GDBM format is not supported"));
            }
            m if [MAGIC_LEGACY, MAGIC_32, MAGIC_64].contains(&m.swap_bytes()) => {
                return Err(invalid("GDBM file was written with foreign byte order"));
            }
            m => return Err(invalid(format!("bad GDBM magic {m:#010x}"))),
        };

        let mut raw = vec![0u8; layout.header_len()];
        file.read_exact_at(&mut raw, 0)?;
        let dir = layout.read_off(&raw, layout.header_dir());
        let dir_size = read_i32(&raw, layout.header_dir_size());
        let dir_bits = read_i32(&raw, layout.header_dir_bits());
        let bucket_size = read_i32(&raw, layout.header_bucket_size());
        let bucket_elems = read_i32(&raw, layout.header_bucket_elems());

        if !(0..=HASH_BITS as i32).contains(&dir_bits) {
            return Err(invalid(format!("bad directory depth {dir_bits}")));
        }
        let slots = 1usize << dir_bits;
        if dir_size < 0 || (dir_size as usize) < slots * layout.off {
            return Err(invalid(format!(
                "directory of {dir_size} bytes cannot hold {slots} entries"
            )));
        }
        if bucket_elems <= 0
            || bucket_size < 0
            || (bucket_size as usize)
                < layout.bucket_table() + bucket_elems as usize * layout.element_size()
        {
            return Err(invalid(format!(
                "bucket of {bucket_size} bytes cannot hold {bucket_elems} elements"
            )));
        }
        if !within(dir, slots * layout.off, file_len) {
            return Err(invalid("hash directory lies past end of file"));
        }

        let mut raw_dir = vec![0u8; slots * layout.off];
        file.read_exact_at(&mut raw_dir, dir)?;
        let dir_entries = (0..slots)
            .map(|i| layout.read_off(&raw_dir, i * layout.off))
            .collect();

        tracing::debug!(
            file_len,
            dir_bits,
            bucket_elems,
            off = layout.off,
            "opened gdbm database"
        );

        Ok(GdbmFile {
            file,
            file_len,
            header: Header {
                layout,
                dir,
                dir_bits: dir_bits as u32,
                bucket_size: bucket_size as usize,
                bucket_elems: bucket_elems as usize,
            },
            dir: dir_entries,
            buckets: LruCache::new(BUCKET_CACHE),
        })
    }

    fn bucket(&mut self, address: u64) -> io::Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.get(&address) {
            return Ok(bucket.clone());
        }
        let header = &self.header;
        if !within(address, header.bucket_size, self.file_len) {
            return Err(invalid(format!("bucket at {address} lies past end of file")));
        }
        let mut raw = vec![0u8; header.bucket_size];
        self.file.read_exact_at(&mut raw, address)?;

        let layout = header.layout;
        let table = layout.bucket_table();
        let elements = (0..header.bucket_elems)
            .map(|i| {
                let at = table + i * layout.element_size();
                Element {
                    hash: read_i32(&raw, at),
                    key_start: array(&raw, at + 4),
                    data_pointer: layout.read_off(&raw, at + 8),
                    key_size: read_i32(&raw, at + layout.element_key_size()).max(0) as usize,
                    data_size: read_i32(&raw, at + layout.element_data_size()).max(0) as usize,
                }
            })
            .collect();
        let bucket = Arc::new(Bucket { elements });
        self.buckets.put(address, bucket.clone());
        Ok(bucket)
    }

    fn read_entry(&self, element: &Element) -> io::Result<Vec<u8>> {
        let len = element.key_size + element.data_size;
        if !within(element.data_pointer, len, self.file_len) {
            return Err(invalid(format!(
                "record at {} lies past end of file",
                element.data_pointer
            )));
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, element.data_pointer)?;
        Ok(buf)
    }
}

impl KvStore for GdbmFile {
    fn fetch(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let hash = hash(key);
        let slot = (hash >> (HASH_BITS - self.header.dir_bits)) as usize;
        let address = self.dir[slot];
        let bucket = self.bucket(address)?;

        let n = bucket.elements.len();
        let inline = key.len().min(KEY_START);
        let start = hash as usize % n;
        for step in 0..n {
            let element = &bucket.elements[(start + step) % n];
            if element.hash == EMPTY_SLOT {
                break;
            }
            if element.hash as u32 != hash
                || element.key_size != key.len()
                || element.key_start[..inline] != key[..inline]
            {
                continue;
            }
            let mut entry = self.read_entry(element)?;
            if entry[..element.key_size] == *key {
                entry.drain(..element.key_size);
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
