//! Command line and the validated mount configuration built from it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;

use crate::content::BackingMode;
use crate::fuse::mount::MountConfig;
use crate::symlink::SymlinkPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "dedupefs",
    author,
    version,
    about = "Mount a captured directory tree read-only from its metadata database"
)]
pub struct Args {
    /// GDBM metadata database produced by the capture tool
    pub dbpath: PathBuf,

    /// Backing directory holding the file contents
    pub srcdir: PathBuf,

    /// Empty directory to mount on
    pub mountpoint: PathBuf,

    /// How regular files map to the backing directory
    #[arg(long, value_enum, default_value_t = BackingMode::Indirect)]
    pub backing: BackingMode,

    /// How absolute symlink targets are served
    #[arg(long, value_enum, default_value_t = SymlinkPolicy::StripTopLevel)]
    pub symlinks: SymlinkPolicy,

    /// Mount directly instead of through fusermount3 (needs CAP_SYS_ADMIN)
    #[arg(long)]
    pub privileged: bool,

    /// Let other users access the mount (needs user_allow_other in /etc/fuse.conf)
    #[arg(long)]
    pub allow_other: bool,

    /// Seconds the kernel may cache entries and attributes
    #[arg(long, default_value_t = 60)]
    pub attr_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    /// Canonical backing root.
    pub backing_root: PathBuf,
    pub mountpoint: PathBuf,
    pub backing: BackingMode,
    pub symlinks: SymlinkPolicy,
    pub mount: MountConfig,
    pub ttl: Duration,
    /// Block size of the filesystem holding the backing root.
    pub blksize: u32,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Config> {
        let backing_root = args
            .srcdir
            .canonicalize()
            .with_context(|| format!("cannot resolve backing directory {}", args.srcdir.display()))?;
        if !backing_root.is_dir() {
            bail!("backing path {} is not a directory", backing_root.display());
        }
        let st = nix::sys::statvfs::statvfs(&backing_root)
            .with_context(|| format!("statvfs {} failed", backing_root.display()))?;
        if !args.mountpoint.is_dir() {
            bail!("mount point {} is not a directory", args.mountpoint.display());
        }

        Ok(Config {
            db_path: args.dbpath,
            backing_root,
            mountpoint: args.mountpoint,
            backing: args.backing,
            symlinks: args.symlinks,
            mount: MountConfig {
                privileged: args.privileged,
                allow_other: args.allow_other,
            },
            ttl: Duration::from_secs(args.attr_timeout),
            blksize: st.block_size() as u32,
        })
    }
}
