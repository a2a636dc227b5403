use std::io;
use std::path::PathBuf;

use rfuse3::Errno;

use crate::record::DecodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such entry: {}", .0.display())]
    NotFound(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    /// The record exists but has the wrong kind for the request
    /// (readlink on a non-link, open on a link).
    #[error("invalid request for {}", .0.display())]
    InvalidKind(PathBuf),

    #[error("corrupt record for {}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("stored backing path for {} escapes the backing root", .0.display())]
    UnsafeBackingPath(PathBuf),

    #[error("read-only filesystem")]
    ReadOnlyViolation,

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::InvalidKind(_) => libc::EINVAL,
            Error::CorruptRecord { .. } | Error::UnsafeBackingPath(_) => libc::EIO,
            Error::ReadOnlyViolation => libc::EROFS,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::BadHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<Error> for Errno {
    fn from(val: Error) -> Self {
        val.errno().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_errno() {
        let err = Error::from(io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(err.errno(), libc::EMFILE);

        let err = Error::from(io::Error::other("no os code"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn taxonomy_maps_to_errno() {
        let p = PathBuf::from("/a");
        assert_eq!(Error::NotFound(p.clone()).errno(), libc::ENOENT);
        assert_eq!(Error::NotADirectory(p.clone()).errno(), libc::ENOTDIR);
        assert_eq!(Error::ReadOnlyViolation.errno(), libc::EROFS);
        assert_eq!(Error::PermissionDenied(p.clone()).errno(), libc::EACCES);
        let corrupt = Error::CorruptRecord {
            path: p,
            source: DecodeError::TooShort(3),
        };
        assert_eq!(corrupt.errno(), libc::EIO);
    }
}
