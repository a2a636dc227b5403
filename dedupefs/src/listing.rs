//! Directory listing records: child base names, each NUL-terminated, in
//! storage order.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// Name of the parent entry put in front of every listing.
pub const PARENT: &str = "..";

/// Splits a packed listing into names.
///
/// A missing final terminator still yields the last name. Empty names are
/// dropped; a trailing one is the normal result of the final terminator.
pub fn split_names(payload: &[u8]) -> Vec<OsString> {
    let mut names = Vec::new();
    let segments: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.into_iter().enumerate() {
        if segment.is_empty() {
            if i != last {
                tracing::warn!(index = i, "skipping empty name in directory listing");
            }
            continue;
        }
        names.push(OsStr::from_bytes(segment).to_os_string());
    }
    names
}

/// `..` followed by the stored children.
pub fn entries(payload: Option<&[u8]>) -> Vec<OsString> {
    let mut out = vec![OsString::from(PARENT)];
    if let Some(payload) = payload {
        out.extend(split_names(payload));
    }
    out
}

/// Packs names the way the database stores them.
pub fn pack<I, S>(names: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_ref().as_bytes());
        out.push(0);
    }
    out
}
