//! FUSE adapter.
//!
//! `DedupeFs` implements the rfuse3 raw `Filesystem` trait on top of a
//! [`Snapshot`]: inodes are translated to virtual paths through the
//! [`InodeTable`], the snapshot answers, and errors become errno values at
//! this boundary. Every mutating request is refused with `EROFS` without
//! touching the database or the backing store.
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCopyFileRange, ReplyCreated,
    ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Result as FuseResult, SetAttr};

use crate::attr::FileAttributes;
use crate::kv::KvStore;
use crate::vfs::Snapshot;
use inode::{InodeTable, child_path};

/// Records never change while mounted, so the kernel may cache freely.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

const MAX_WRITE: NonZeroU32 = match NonZeroU32::new(128 * 1024) {
    Some(n) => n,
    None => unreachable!(),
};

fn read_only() -> Errno {
    libc::EROFS.into()
}

pub struct DedupeFs<S> {
    snapshot: Snapshot<S>,
    inodes: InodeTable,
    ttl: Duration,
}

impl<S: KvStore> DedupeFs<S> {
    pub fn new(snapshot: Snapshot<S>) -> Self {
        Self {
            snapshot,
            inodes: InodeTable::new(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn snapshot(&self) -> &Snapshot<S> {
        &self.snapshot
    }

    fn path(&self, ino: u64) -> FuseResult<PathBuf> {
        self.inodes.path_of(ino).ok_or_else(|| {
            tracing::debug!(ino, "unknown inode");
            Errno::from(libc::ENOENT)
        })
    }

    /// Projected attributes of `path` under its (possibly new) inode.
    fn attr(&self, path: &Path) -> FuseResult<FileAttr> {
        let attr = self.snapshot.getattr(path).map_err(Errno::from)?;
        Ok(attr.to_fuse(self.inodes.ino_of(path)))
    }

    /// Entries of the directory at `path` from position `offset` on, each
    /// carrying the offset of the entry after it. Children without a usable
    /// metadata record are left out.
    fn dir_entries(&self, path: &Path, offset: u64) -> FuseResult<Vec<Listed>> {
        let names = self.snapshot.list(path).map_err(Errno::from)?;
        let mut out = Vec::with_capacity(names.len());
        for (index, name) in names.into_iter().enumerate().skip(offset as usize) {
            let next = index as i64 + 1;
            let child = child_path(path, &name);
            if name == ".." {
                out.push(Listed {
                    offset: next,
                    name,
                    path: child,
                    attr: None,
                });
                continue;
            }
            match self.snapshot.try_getattr(&child) {
                Ok(Some(attr)) => out.push(Listed {
                    offset: next,
                    name,
                    path: child,
                    attr: Some(attr),
                }),
                Ok(None) => {
                    tracing::warn!(path = %child.display(), "listed entry has no metadata, skipping");
                }
                Err(e) => {
                    tracing::warn!(path = %child.display(), error = %e, "skipping unreadable entry");
                }
            }
        }
        Ok(out)
    }
}

struct Listed {
    offset: i64,
    name: OsString,
    path: PathBuf,
    /// `None` for `..`, whose record is only read for readdirplus.
    attr: Option<FileAttributes>,
}

impl Listed {
    fn kind(&self) -> FileType {
        self.attr.map_or(FileType::Directory, |attr| attr.kind())
    }
}

impl<S> Filesystem for DedupeFs<S>
where
    S: KvStore + Send + Sync + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        tracing::info!(
            root = %self.snapshot.content().root().display(),
            backing = ?self.snapshot.content().mode(),
            "filesystem initialised"
        );
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        tracing::info!(
            lookups = self.snapshot.lookups(),
            open_handles = self.snapshot.content().open_handles(),
            "filesystem destroyed"
        );
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let parent = self.path(parent)?;
        let path = child_path(&parent, name);
        let attr = self.attr(&path)?;
        Ok(ReplyEntry {
            ttl: self.ttl,
            attr,
            generation: 0,
        })
    }

    // inodes live for the whole mount
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: self.attr(&path)?,
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path(ino)?;
        let target = self.snapshot.readlink(&path).map_err(Errno::from)?;
        Ok(ReplyData {
            data: Bytes::from(target),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let fh = self.snapshot.open(&path, flags).map_err(Errno::from)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self
            .snapshot
            .read(fh, offset, size as usize)
            .map_err(Errno::from)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.snapshot.release(fh);
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let record = self.snapshot.record(&path).map_err(Errno::from)?;
        if !record.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path(ino)?;
        let entries = self.dir_entries(&path, offset.max(0) as u64)?;
        let entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .map(|entry| DirectoryEntry {
                inode: self.inodes.ino_of(&entry.path),
                kind: entry.kind(),
                name: entry.name,
                offset: entry.offset,
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path(ino)?;
        let mut all = Vec::new();
        for entry in self.dir_entries(&path, offset)? {
            let kind = entry.kind();
            let attr = match entry.attr {
                Some(attr) => attr.to_fuse(self.inodes.ino_of(&entry.path)),
                None => match self.attr(&entry.path) {
                    Ok(attr) => attr,
                    Err(_) => continue,
                },
            };
            all.push(DirectoryEntryPlus {
                inode: attr.ino,
                generation: 0,
                kind,
                name: entry.name,
                offset: entry.offset,
                attr,
                entry_ttl: self.ttl,
                attr_ttl: self.ttl,
            });
        }
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.snapshot.statfs().map_err(Errno::from)?;
        Ok(ReplyStatFs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        let path = self.path(ino)?;
        self.snapshot.access(&path, mask).map_err(Errno::from)
    }

    // ===== mutators: the tree is read-only =====

    async fn setattr(
        &self,
        _req: Request,
        _ino: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        Err(read_only())
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        Err(read_only())
    }

    async fn mknod(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(read_only())
    }

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(read_only())
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        Err(read_only())
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(read_only())
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(read_only())
    }

    async fn symlink(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        Err(read_only())
    }

    async fn link(
        &self,
        _req: Request,
        _ino: u64,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        Err(read_only())
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<()> {
        Err(read_only())
    }

    async fn rename2(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
        _flags: u32,
    ) -> FuseResult<()> {
        Err(read_only())
    }

    async fn fallocate(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> FuseResult<()> {
        Err(read_only())
    }

    async fn copy_file_range(
        &self,
        _req: Request,
        _inode: u64,
        _fh_in: u64,
        _off_in: u64,
        _inode_out: u64,
        _fh_out: u64,
        _off_out: u64,
        _length: u64,
        _flags: u64,
    ) -> FuseResult<ReplyCopyFileRange> {
        Err(read_only())
    }

    async fn setxattr(
        &self,
        _req: Request,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        Err(read_only())
    }

    async fn removexattr(&self, _req: Request, _ino: u64, _name: &OsStr) -> FuseResult<()> {
        Err(read_only())
    }
}
