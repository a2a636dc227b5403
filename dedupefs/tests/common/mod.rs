#![allow(dead_code)]

//! Shared fixtures: writes real GDBM images and backing trees into
//! temporary directories.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use dedupefs::config::Config;
use dedupefs::content::BackingMode;
use dedupefs::fuse::mount::MountConfig;
use dedupefs::gdbm::{self, EMPTY_SLOT, HASH_BITS, KEY_START, Layout};
use dedupefs::kv::{Discriminator, key_for};
use dedupefs::listing::pack;
use dedupefs::record::{Kind, Record};
use dedupefs::symlink::SymlinkPolicy;

const BLOCK: usize = 512;

fn put_off(buf: &mut [u8], at: usize, layout: Layout, value: u64) {
    if layout.off == 8 {
        buf[at..at + 8].copy_from_slice(&value.to_ne_bytes());
    } else {
        buf[at..at + 4].copy_from_slice(&(value as u32).to_ne_bytes());
    }
}

fn put_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Writes `entries` as a GDBM file with `1 << dir_bits` buckets of
/// `bucket_elems` slots each. Panics if a bucket overflows.
pub fn write_gdbm(
    path: &Path,
    layout: Layout,
    entries: &[(Vec<u8>, Vec<u8>)],
    dir_bits: u32,
    bucket_elems: usize,
) {
    let slots = 1usize << dir_bits;
    let bucket_size = layout.bucket_table() + bucket_elems * layout.element_size();
    let dir_at = BLOCK;
    let buckets_at = dir_at + (slots * layout.off).div_ceil(BLOCK) * BLOCK;
    let data_at = buckets_at + slots * bucket_size;

    let mut buckets = vec![vec![0u8; bucket_size]; slots];
    for bucket in &mut buckets {
        put_i32(bucket, layout.bucket_bits(), dir_bits as i32);
        for i in 0..bucket_elems {
            put_i32(bucket, layout.bucket_table() + i * layout.element_size(), EMPTY_SLOT);
        }
    }

    let mut data = Vec::new();
    for (key, value) in entries {
        let hash = gdbm::hash(key);
        let slot = (hash >> (HASH_BITS - dir_bits)) as usize;
        let bucket = &mut buckets[slot];
        let mut index = hash as usize % bucket_elems;
        let mut steps = 0;
        while i32::from_ne_bytes(
            bucket[layout.bucket_table() + index * layout.element_size()..][..4]
                .try_into()
                .unwrap(),
        ) != EMPTY_SLOT
        {
            index = (index + 1) % bucket_elems;
            steps += 1;
            assert!(steps < bucket_elems, "bucket {slot} overflowed");
        }

        let at = layout.bucket_table() + index * layout.element_size();
        put_i32(bucket, at, hash as i32);
        let mut start = [0u8; KEY_START];
        let inline = key.len().min(KEY_START);
        start[..inline].copy_from_slice(&key[..inline]);
        bucket[at + 4..at + 4 + KEY_START].copy_from_slice(&start);
        put_off(bucket, at + 8, layout, (data_at + data.len()) as u64);
        put_i32(bucket, at + layout.element_key_size(), key.len() as i32);
        put_i32(bucket, at + layout.element_data_size(), value.len() as i32);
        let count_at = layout.bucket_count();
        let count = i32::from_ne_bytes(bucket[count_at..count_at + 4].try_into().unwrap());
        put_i32(bucket, count_at, count + 1);

        data.extend_from_slice(key);
        data.extend_from_slice(value);
    }

    let mut image = vec![0u8; data_at];
    let magic = if layout.off == 8 { gdbm::MAGIC_64 } else { gdbm::MAGIC_32 };
    image[..4].copy_from_slice(&magic.to_ne_bytes());
    put_i32(&mut image, 4, BLOCK as i32);
    put_off(&mut image, layout.header_dir(), layout, dir_at as u64);
    put_i32(&mut image, layout.header_dir_size(), (slots * layout.off) as i32);
    put_i32(&mut image, layout.header_dir_bits(), dir_bits as i32);
    put_i32(&mut image, layout.header_bucket_size(), bucket_size as i32);
    put_i32(&mut image, layout.header_bucket_elems(), bucket_elems as i32);
    put_off(
        &mut image,
        layout.header_next_block(),
        layout,
        (data_at + data.len()) as u64,
    );
    for slot in 0..slots {
        put_off(
            &mut image,
            dir_at + slot * layout.off,
            layout,
            (buckets_at + slot * bucket_size) as u64,
        );
    }
    for (slot, bucket) in buckets.iter().enumerate() {
        let at = buckets_at + slot * bucket_size;
        image[at..at + bucket_size].copy_from_slice(bucket);
    }
    image.extend_from_slice(&data);
    fs::write(path, image).unwrap();
}

pub fn record(kind: Kind, mode: u16, size: u64, payload: Option<&[u8]>) -> Record {
    Record {
        kind,
        mode,
        uid: 1000,
        gid: 1000,
        atime: 1_600_000_000,
        mtime: 1_600_000_100,
        ctime: 1_600_000_200,
        size,
        reserved: [0; 5],
        payload: payload.map(<[u8]>::to_vec),
    }
}

/// A captured tree under construction: metadata records, listings in
/// insertion order, and blobs in a content-addressed backing store.
pub struct TreeBuilder {
    pub root: tempfile::TempDir,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    children: HashMap<PathBuf, Vec<OsString>>,
    order: Vec<PathBuf>,
    unlisted: Vec<PathBuf>,
    blobs: usize,
}

impl TreeBuilder {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("store")).unwrap();
        fs::create_dir(root.path().join("mnt")).unwrap();
        let mut builder = Self {
            root,
            entries: Vec::new(),
            children: HashMap::new(),
            order: Vec::new(),
            unlisted: Vec::new(),
            blobs: 0,
        };
        builder.meta("/", record(Kind::Directory, 0o755, 4096, None));
        builder.children.insert(PathBuf::from("/"), Vec::new());
        builder.order.push(PathBuf::from("/"));
        builder
    }

    pub fn store(&self) -> PathBuf {
        self.root.path().join("store")
    }

    pub fn db(&self) -> PathBuf {
        self.root.path().join("meta.gdbm")
    }

    fn meta(&mut self, path: &str, record: Record) {
        self.entries.push((
            key_for(Path::new(path), Discriminator::Metadata),
            record.encode(),
        ));
    }

    fn link_child(&mut self, path: &str) {
        let path = Path::new(path);
        let parent = path.parent().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_os_string();
        self.children.entry(parent).or_default().push(name);
    }

    pub fn dir(&mut self, path: &str, mode: u16) -> &mut Self {
        self.meta(path, record(Kind::Directory, mode, 4096, None));
        self.link_child(path);
        self.children.insert(PathBuf::from(path), Vec::new());
        self.order.push(PathBuf::from(path));
        self
    }

    /// Directory with a metadata record but no listing record.
    pub fn dir_without_listing(&mut self, path: &str, mode: u16) -> &mut Self {
        self.meta(path, record(Kind::Directory, mode, 4096, None));
        self.link_child(path);
        self.unlisted.push(PathBuf::from(path));
        self
    }

    /// Regular file whose bytes go to a fresh blob in the store.
    pub fn file(&mut self, path: &str, mode: u16, content: &[u8]) -> &mut Self {
        self.blobs += 1;
        let blob = format!("{:02x}/{:08x}", self.blobs % 256, self.blobs);
        let at = self.store().join(&blob);
        fs::create_dir_all(at.parent().unwrap()).unwrap();
        fs::write(at, content).unwrap();
        self.meta(
            path,
            record(Kind::Regular, mode, content.len() as u64, Some(blob.as_bytes())),
        );
        self.link_child(path);
        self
    }

    /// Regular file stored under its own path, as the direct layout expects.
    pub fn mirrored_file(&mut self, path: &str, mode: u16, content: &[u8]) -> &mut Self {
        let at = self.store().join(path.trim_start_matches('/'));
        fs::create_dir_all(at.parent().unwrap()).unwrap();
        fs::write(at, content).unwrap();
        self.meta(path, record(Kind::Regular, mode, content.len() as u64, None));
        self.link_child(path);
        self
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.meta(
            path,
            record(
                Kind::Symlink,
                0o777,
                target.len() as u64,
                Some(target.as_bytes()),
            ),
        );
        self.link_child(path);
        self
    }

    /// Listed in its parent but without any metadata record.
    pub fn dangling(&mut self, path: &str) -> &mut Self {
        self.link_child(path);
        self
    }

    pub fn raw_meta(&mut self, path: &str, bytes: Vec<u8>) -> &mut Self {
        self.entries
            .push((key_for(Path::new(path), Discriminator::Metadata), bytes));
        self.link_child(path);
        self
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = self.entries.clone();
        for dir in &self.order {
            if self.unlisted.contains(dir) {
                continue;
            }
            let names = self.children.get(dir).cloned().unwrap_or_default();
            entries.push((key_for(dir, Discriminator::Listing), pack(names)));
        }
        entries
    }

    pub fn build(&self) -> PathBuf {
        let db = self.db();
        write_gdbm(&db, Layout::OFF64, &self.entries(), 2, 64);
        db
    }

    pub fn config(&self, backing: BackingMode) -> Config {
        Config {
            db_path: self.db(),
            backing_root: self.store().canonicalize().unwrap(),
            mountpoint: self.root.path().join("mnt"),
            backing,
            symlinks: SymlinkPolicy::StripTopLevel,
            mount: MountConfig::default(),
            ttl: std::time::Duration::from_secs(1),
            blksize: 4096,
        }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
