//! Symlink target rewriting.
//!
//! Stored link targets come from the captured device and are often
//! absolute (`/data/app/...`, `/system/lib/...`). Served verbatim they would
//! resolve against the caller's root instead of the mounted tree, so the
//! default policy turns them into paths relative to the link's directory.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use clap::ValueEnum;

pub trait TargetRewriter: Send + Sync {
    fn rewrite(&self, link_path: &Path, stored_target: &[u8]) -> Vec<u8>;
}

/// Relative targets pass through. Absolute targets drop their first
/// component (the partition directory of the captured device) and climb one
/// `../` for every directory of the link beyond the first.
///
/// This is best effort: it is only right when the mounted tree keeps that
/// partition as its top-level directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripTopLevel;

impl TargetRewriter for StripTopLevel {
    fn rewrite(&self, link_path: &Path, stored_target: &[u8]) -> Vec<u8> {
        let Some(absolute) = stored_target.strip_prefix(b"/") else {
            return stored_target.to_vec();
        };
        let Some(sep) = absolute.iter().position(|&b| b == b'/') else {
            tracing::debug!(
                target = %OsStr::from_bytes(stored_target).to_string_lossy(),
                "absolute link target has no second component, leaving as is"
            );
            return stored_target.to_vec();
        };
        let remainder = &absolute[sep + 1..];

        let depth = link_path
            .parent()
            .map_or(0, |dir| dir.components().count().saturating_sub(2));
        let mut out = Vec::with_capacity(depth * 3 + remainder.len());
        for _ in 0..depth {
            out.extend_from_slice(b"../");
        }
        out.extend_from_slice(remainder);
        out
    }
}

/// Serves stored targets unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Verbatim;

impl TargetRewriter for Verbatim {
    fn rewrite(&self, _link_path: &Path, stored_target: &[u8]) -> Vec<u8> {
        stored_target.to_vec()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SymlinkPolicy {
    /// Rewrite absolute targets relative to the link
    #[default]
    StripTopLevel,
    /// Serve stored targets unchanged
    Verbatim,
}

impl SymlinkPolicy {
    pub fn rewriter(self) -> Box<dyn TargetRewriter> {
        match self {
            SymlinkPolicy::StripTopLevel => Box::new(StripTopLevel),
            SymlinkPolicy::Verbatim => Box::new(Verbatim),
        }
    }
}
