//! Content access: maps regular files to their backing location and serves
//! positioned reads from per-open file descriptors.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use clap::ValueEnum;

use crate::error::{Error, Result};
use crate::record::Record;

/// Open flags that would allow modifying the file or the tree.
pub const WRITE_FLAGS: i32 =
    libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND;

/// Where file bytes live relative to the backing root.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackingMode {
    /// Backing path is the virtual path under the root
    Direct,
    /// Backing path is stored in the metadata record (deduplicated store)
    #[default]
    Indirect,
}

pub fn check_open_flags(flags: u32) -> Result<()> {
    if flags as i32 & WRITE_FLAGS != 0 {
        return Err(Error::ReadOnlyViolation);
    }
    Ok(())
}

pub struct ContentGateway {
    root: PathBuf,
    mode: BackingMode,
    next_handle: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<File>>>,
}

impl ContentGateway {
    pub fn new(root: impl Into<PathBuf>, mode: BackingMode) -> Self {
        Self {
            root: root.into(),
            mode,
            // 0 is never handed out
            next_handle: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> BackingMode {
        self.mode
    }

    /// Backing location of the regular file at `virtual_path`.
    pub fn resolve(&self, virtual_path: &Path, record: &Record) -> Result<PathBuf> {
        match (self.mode, record.payload.as_deref()) {
            (BackingMode::Indirect, Some(stored)) if !stored.is_empty() => {
                self.under_root(Path::new(OsStr::from_bytes(stored)), virtual_path)
            }
            _ => self.under_root(virtual_path, virtual_path),
        }
    }

    fn under_root(&self, relative: &Path, virtual_path: &Path) -> Result<PathBuf> {
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::UnsafeBackingPath(virtual_path.to_path_buf()));
                }
            }
        }
        Ok(out)
    }

    /// Opens the backing file read-only and returns a new handle.
    pub fn open(&self, virtual_path: &Path, record: &Record) -> Result<u64> {
        let backing = self.resolve(virtual_path, record)?;
        let file = OpenOptions::new().read(true).open(&backing).map_err(|e| {
            tracing::debug!(backing = %backing.display(), error = %e, "backing open failed");
            e
        })?;
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, Arc::new(file));
        tracing::debug!(fh, path = %virtual_path.display(), backing = %backing.display(), "opened");
        Ok(fh)
    }

    /// Reads up to `len` bytes at `offset`. Short only at end of file.
    pub fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fh)
            .cloned()
            .ok_or(Error::BadHandle(fh))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Releases a handle. Never fails; close errors are only logged.
    pub fn close(&self, fh: u64) {
        let removed = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fh);
        let Some(file) = removed else {
            tracing::debug!(fh, "release of unknown handle");
            return;
        };
        // A read still in flight holds the other reference and closes on drop.
        if let Ok(file) = Arc::try_unwrap(file) {
            if let Err(e) = nix::unistd::close(file.into_raw_fd()) {
                tracing::error!(fh, error = %e, "closing backing file failed");
            }
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
