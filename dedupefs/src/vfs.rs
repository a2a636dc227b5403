//! Path-level view of a captured tree.
//!
//! `Snapshot` answers every read-only request by virtual path: metadata and
//! listings come from the key-value database through [`Lookup`], file bytes
//! from the [`ContentGateway`]. The FUSE adapter in [`crate::fuse`] only
//! maps inodes to paths and replies.

use std::ffi::OsString;
use std::path::Path;

use nix::sys::statvfs::{Statvfs, statvfs};

use crate::attr::{FileAttributes, project};
use crate::content::{ContentGateway, check_open_flags};
use crate::error::{Error, Result};
use crate::kv::{Discriminator, KvStore, Lookup};
use crate::listing;
use crate::record::{Kind, Record};
use crate::symlink::TargetRewriter;

pub struct Snapshot<S> {
    lookup: Lookup<S>,
    content: ContentGateway,
    rewriter: Box<dyn TargetRewriter>,
    blksize: u32,
}

impl<S> std::fmt::Debug for Snapshot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("blksize", &self.blksize)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> Snapshot<S> {
    /// `blksize` is the block size of the backing filesystem, reported in
    /// every attribute reply.
    pub fn new(
        store: S,
        content: ContentGateway,
        rewriter: Box<dyn TargetRewriter>,
        blksize: u32,
    ) -> Self {
        Self {
            lookup: Lookup::new(store),
            content,
            rewriter,
            blksize,
        }
    }

    pub fn content(&self) -> &ContentGateway {
        &self.content
    }

    /// Database lookups issued so far.
    pub fn lookups(&self) -> u64 {
        self.lookup.lookups()
    }

    pub fn try_record(&self, path: &Path) -> Result<Option<Record>> {
        let Some(raw) = self.lookup.get(path, Discriminator::Metadata)? else {
            return Ok(None);
        };
        match Record::decode(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(source) => {
                tracing::error!(
                    path = %path.display(),
                    error = %source,
                    len = raw.len(),
                    "corrupt metadata record, database may be damaged or incompatible"
                );
                Err(Error::CorruptRecord {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    pub fn record(&self, path: &Path) -> Result<Record> {
        self.try_record(path)?
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    /// Like [`Snapshot::getattr`], with a missing record as `None`.
    pub fn try_getattr(&self, path: &Path) -> Result<Option<FileAttributes>> {
        Ok(self
            .try_record(path)?
            .map(|record| project(&record, self.blksize)))
    }

    pub fn getattr(&self, path: &Path) -> Result<FileAttributes> {
        let record = self.record(path)?;
        Ok(project(&record, self.blksize))
    }

    pub fn readlink(&self, path: &Path) -> Result<Vec<u8>> {
        let record = self.record(path)?;
        if record.kind != Kind::Symlink {
            return Err(Error::InvalidKind(path.to_path_buf()));
        }
        let stored = record.payload.unwrap_or_default();
        Ok(self.rewriter.rewrite(path, &stored))
    }

    /// Directory entries: `..` followed by the stored children.
    ///
    /// A missing listing is ambiguous on its own, so the metadata record
    /// decides: no record is `NotFound`, a non-directory is `NotADirectory`,
    /// and a directory without a listing is empty.
    pub fn list(&self, path: &Path) -> Result<Vec<OsString>> {
        if let Some(payload) = self.lookup.get(path, Discriminator::Listing)? {
            return Ok(listing::entries(Some(&payload)));
        }
        match self.try_record(path)? {
            None => Err(Error::NotFound(path.to_path_buf())),
            Some(record) if !record.is_dir() => Err(Error::NotADirectory(path.to_path_buf())),
            Some(_) => {
                tracing::debug!(path = %path.display(), "directory has no listing record");
                Ok(listing::entries(None))
            }
        }
    }

    /// Opens a regular file. Write-like flags fail before any lookup.
    pub fn open(&self, path: &Path, flags: u32) -> Result<u64> {
        check_open_flags(flags)?;
        let record = self.record(path)?;
        match record.kind {
            Kind::Regular => self.content.open(path, &record),
            Kind::Directory => Err(Error::IsADirectory(path.to_path_buf())),
            Kind::Symlink => Err(Error::InvalidKind(path.to_path_buf())),
        }
    }

    pub fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.content.read(fh, offset, len)
    }

    pub fn release(&self, fh: u64) {
        self.content.close(fh);
    }

    /// Write access is refused outright; execute needs the owner execute
    /// bit. Everything else is granted once the path exists.
    pub fn access(&self, path: &Path, mask: u32) -> Result<()> {
        let mask = mask as i32;
        if mask & libc::W_OK != 0 {
            return Err(Error::ReadOnlyViolation);
        }
        let record = self.record(path)?;
        if mask & libc::X_OK != 0 && record.mode as u32 & libc::S_IXUSR == 0 {
            return Err(Error::PermissionDenied(path.to_path_buf()));
        }
        Ok(())
    }

    /// Statistics of the filesystem holding the backing root.
    pub fn statfs(&self) -> Result<Statvfs> {
        statvfs(self.content.root()).map_err(|errno| Error::Io(errno.into()))
    }
}
