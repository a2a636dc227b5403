//! Key-value lookup adapter.
//!
//! The metadata database is a single read-only handle shared by every
//! request. Handles are not required to be safe for concurrent use, so all
//! lookups serialize on one mutex that is held only for the fetch itself.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Read access to a key-value database.
///
/// `fetch` takes `&mut self` so that implementations can keep caches or a
/// file cursor without interior locking; [`Lookup`] provides the locking.
pub trait KvStore {
    fn fetch(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

/// Record kind tag prefixed to every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Discriminator {
    /// Per-path metadata record.
    Metadata = b'f',
    /// Packed child-name list of a directory.
    Listing = b'd',
}

/// Builds `discriminator || path`.
pub fn key_for(path: &Path, discriminator: Discriminator) -> Vec<u8> {
    let path = path.as_os_str().as_bytes();
    let mut key = Vec::with_capacity(path.len() + 1);
    key.push(discriminator as u8);
    key.extend_from_slice(path);
    key
}

pub struct Lookup<S> {
    store: Mutex<S>,
    lookups: AtomicU64,
}

impl<S: KvStore> Lookup<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
            lookups: AtomicU64::new(0),
        }
    }

    pub fn get(&self, path: &Path, discriminator: Discriminator) -> io::Result<Option<Vec<u8>>> {
        let key = key_for(path, discriminator);
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let value = {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            store.fetch(&key)?
        };
        tracing::trace!(
            path = %path.display(),
            ?discriminator,
            found = value.is_some(),
            "db lookup"
        );
        Ok(value)
    }

    /// Number of lookups issued since construction.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

/// In-memory store, used by tests and by tools that assemble a tree at
/// runtime instead of loading a database file.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl KvStore for MemStore {
    fn fetch(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }
}
