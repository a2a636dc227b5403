//! Mount helpers.
//!
//! Thin wrappers over the rfuse3 raw `Session`. On Linux the default is an
//! unprivileged mount through fusermount3; `privileged` mounts directly and
//! needs CAP_SYS_ADMIN.

use std::path::Path;

#[cfg(target_os = "linux")]
use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;
#[cfg(target_os = "linux")]
use rfuse3::raw::Session;

use super::DedupeFs;
use crate::kv::KvStore;

#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    pub privileged: bool,
    pub allow_other: bool,
}

#[cfg(target_os = "linux")]
fn mount_options(config: &MountConfig) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("dedupefs")
        .read_only(true)
        .force_readdir_plus(true)
        .uid(nix::unistd::getuid().as_raw())
        .gid(nix::unistd::getgid().as_raw());
    if config.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mounts `fs` on the empty directory `mount_point`. The returned handle
/// resolves when the filesystem is unmounted.
#[cfg(target_os = "linux")]
pub async fn mount<S>(
    fs: DedupeFs<S>,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    S: KvStore + Send + Sync + 'static,
{
    let session = Session::new(mount_options(config));
    if config.privileged {
        session.mount(fs, mount_point).await
    } else {
        session.mount_with_unprivileged(fs, mount_point).await
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn mount<S>(
    _fs: DedupeFs<S>,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    S: KvStore + Send + Sync + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
