//! Attribute projection: decoded records to stat-like attributes.

use rfuse3::raw::reply::FileAttr;
use rfuse3::{FileType, Timestamp};

use crate::record::{Kind, Record};

/// `st_blocks` is always counted in 512-byte units.
pub const STAT_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// File-type bits OR'd with the permission bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

pub fn type_bits(kind: Kind) -> u32 {
    match kind {
        Kind::Regular => libc::S_IFREG,
        Kind::Directory => libc::S_IFDIR,
        Kind::Symlink => libc::S_IFLNK,
    }
}

/// Hard links are not tracked, so the link count is always 1.
pub fn project(record: &Record, blksize: u32) -> FileAttributes {
    FileAttributes {
        mode: type_bits(record.kind) | (record.mode as u32 & 0o7777),
        nlink: 1,
        uid: record.uid,
        gid: record.gid,
        size: record.size,
        blocks: record.size.div_ceil(STAT_BLOCK_SIZE),
        blksize,
        atime: record.atime,
        mtime: record.mtime,
        ctime: record.ctime,
    }
}

impl FileAttributes {
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn kind(&self) -> FileType {
        match self.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            _ => FileType::RegularFile,
        }
    }

    pub fn to_fuse(&self, ino: u64) -> FileAttr {
        let atime = timestamp(self.atime);
        let mtime = timestamp(self.mtime);
        let ctime = timestamp(self.ctime);
        FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime,
            mtime,
            ctime,
            #[cfg(target_os = "macos")]
            crtime: ctime,
            kind: self.kind(),
            perm: self.perm(),
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: self.blksize,
        }
    }
}

fn timestamp(secs: u64) -> Timestamp {
    Timestamp::new(secs.min(i64::MAX as u64) as i64, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: Kind, mode: u16, size: u64) -> Record {
        Record {
            kind,
            mode,
            uid: 1000,
            gid: 1001,
            atime: 11,
            mtime: 22,
            ctime: 33,
            size,
            reserved: [0; 5],
            payload: None,
        }
    }

    #[test]
    fn exactly_one_type_bit_matches_kind() {
        for (kind, bits) in [
            (Kind::Regular, libc::S_IFREG),
            (Kind::Directory, libc::S_IFDIR),
            (Kind::Symlink, libc::S_IFLNK),
        ] {
            let attr = project(&record(kind, 0o755, 0), 4096);
            assert_eq!(attr.mode & libc::S_IFMT, bits);
            assert_eq!(attr.mode & 0o7777, 0o755);
            assert_eq!(attr.kind().const_into_mode_t() & libc::S_IFMT, bits);
        }
    }

    #[test]
    fn stray_type_bits_in_mode_are_masked() {
        let attr = project(&record(Kind::Symlink, 0o120777, 0), 4096);
        assert_eq!(attr.mode, libc::S_IFLNK | 0o777);
    }

    #[test]
    fn blocks_round_up_to_512() {
        let cases = [(0, 0), (1, 1), (512, 1), (513, 2), (4096, 8)];
        for (size, blocks) in cases {
            assert_eq!(project(&record(Kind::Regular, 0o644, size), 4096).blocks, blocks);
        }
    }

    #[test]
    fn fuse_attr_copies_fields() {
        let attr = project(&record(Kind::Regular, 0o640, 700), 1024).to_fuse(42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.nlink, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 1001));
        assert_eq!(attr.size, 700);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.blksize, 1024);
        assert_eq!((attr.mtime.sec, attr.mtime.nsec), (22, 0));
        assert_eq!(attr.ctime.sec, 33);
    }
}
