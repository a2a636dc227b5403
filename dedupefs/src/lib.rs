//! dedupefs serves a captured directory tree read-only over FUSE.
//!
//! Metadata (attributes, directory listings, symlink targets) lives in a GDBM
//! database written offline by the capture tool; file contents live in a
//! backing directory, either mirrored under their virtual paths or in a
//! deduplicated store addressed by a path kept in each file's record.

pub mod attr;
pub mod config;
pub mod content;
pub mod error;
pub mod fuse;
pub mod gdbm;
pub mod kv;
pub mod listing;
pub mod record;
pub mod symlink;
pub mod vfs;

use std::path::Path;

use anyhow::{Context, bail};

pub use error::{Error, Result};

use crate::config::Config;
use crate::content::ContentGateway;
use crate::gdbm::GdbmFile;
use crate::vfs::Snapshot;

/// Opens the database named by `config` and checks that it describes a
/// tree, i.e. holds a directory record for `/`.
#[tracing::instrument(skip_all, fields(db = %config.db_path.display()))]
pub fn open_snapshot(config: &Config) -> anyhow::Result<Snapshot<GdbmFile>> {
    let db = GdbmFile::open(&config.db_path)
        .with_context(|| format!("cannot open database {}", config.db_path.display()))?;
    tracing::debug!(db = ?db, "database opened");

    let snapshot = Snapshot::new(
        db,
        ContentGateway::new(&config.backing_root, config.backing),
        config.symlinks.rewriter(),
        config.blksize,
    );
    let root = snapshot
        .record(Path::new("/"))
        .context("database has no usable record for /")?;
    if !root.is_dir() {
        bail!("record for / is not a directory");
    }
    Ok(snapshot)
}
