//! Object-store capability: delimiter-aware paginated listing and whole-object fetch.
//!
//! Two backends ship with the crate: `LocalObjectStore` serves a directory tree
//! (`<root>/<bucket>/<key>`), `MemoryObjectStore` keeps objects in memory with a controllable
//! modification clock.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use walkdir::WalkDir;

use crate::util::create_with_backoff;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ListRequest<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub delimiter: Option<&'a str>,
    /// List strictly after this key or common prefix.
    pub marker: Option<&'a str>,
    pub max_keys: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub bucket: String,
    pub entries: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub next_marker: Option<String>,
    pub truncated: bool,
}

pub trait ObjectStore: Send + Sync {
    fn list(&self, req: &ListRequest<'_>) -> Result<ListPage>;

    fn get(&self, bucket: &str, key: &str) -> Result<(Vec<u8>, ObjectMeta)>;

    /// Fetch an object into `dest`, replacing any existing file.
    fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<ObjectMeta> {
        let (bytes, meta) = self.get(bucket, key)?;
        let mut f = create_with_backoff(dest, 16, 50).with_context(|| format!("create {}", dest.display()))?;
        f.write_all(&bytes)?;
        f.flush()?;
        Ok(meta)
    }
}

/// Build one listing page from a key-sorted object set, S3 style: keys that contain the
/// delimiter after the prefix roll up into common prefixes; entries and prefixes share one
/// lexical order for pagination.
pub fn paginate(bucket: &str, objects: impl IntoIterator<Item = ObjectSummary>, req: &ListRequest<'_>) -> ListPage {
    let mut items: BTreeMap<String, Option<ObjectSummary>> = BTreeMap::new();
    for obj in objects {
        let Some(rest) = obj.key.strip_prefix(req.prefix) else { continue };
        if let Some(delim) = req.delimiter.filter(|d| !d.is_empty()) {
            if let Some(idx) = rest.find(delim) {
                let cp = format!("{}{}", req.prefix, &rest[..idx + delim.len()]);
                items.entry(cp).or_insert(None);
                continue;
            }
        }
        items.insert(obj.key.clone(), Some(obj));
    }

    let mut page = ListPage { bucket: bucket.to_string(), ..Default::default() };
    let mut remaining = items
        .into_iter()
        .filter(|(k, _)| req.marker.map_or(true, |m| k.as_str() > m));
    let mut last = None;
    for (name, item) in remaining.by_ref().take(req.max_keys.max(1)) {
        match item {
            Some(obj) => page.entries.push(obj),
            None => page.common_prefixes.push(name.clone()),
        }
        last = Some(name);
    }
    page.truncated = remaining.next().is_some();
    if page.truncated {
        page.next_marker = last;
    }
    page
}

// ----------------------------- Local directory ----------------------------------

/// Serves `<root>/<bucket>/<key>`; key segments map to directories.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == "..") || bucket.contains(['/', '\\']) {
            return Err(anyhow!("refusing path traversal in {bucket}/{key}"));
        }
        Ok(self.root.join(bucket).join(key))
    }

    fn meta_of(path: &Path) -> Result<ObjectMeta> {
        let md = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        Ok(ObjectMeta { size: md.len(), last_modified: DateTime::<Utc>::from(md.modified()?) })
    }
}

impl ObjectStore for LocalObjectStore {
    /// Walks only the directory the prefix points into. With a `/` delimiter the walk stays one
    /// level deep and subdirectories are reported as common prefixes.
    fn list(&self, req: &ListRequest<'_>) -> Result<ListPage> {
        let base = self.root.join(req.bucket);
        if !base.is_dir() {
            return Err(anyhow!("no such bucket: {}", req.bucket));
        }
        let dir_part = req.prefix.rfind('/').map_or("", |i| &req.prefix[..i]);
        let start = self.object_path(req.bucket, dir_part)?;
        if !start.is_dir() {
            return Ok(paginate(req.bucket, Vec::new(), req));
        }
        let shallow = req.delimiter == Some("/");
        let walker = WalkDir::new(&start)
            .min_depth(1)
            .max_depth(if shallow { 1 } else { usize::MAX })
            .sort_by_file_name();

        let mut objects = Vec::new();
        for entry in walker {
            let entry = entry?;
            let is_dir = entry.file_type().is_dir();
            if !is_dir && !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base)?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(req.prefix) {
                continue;
            }
            if is_dir {
                // `paginate` rolls `<dir>/` up into a common prefix.
                if shallow {
                    objects.push(ObjectSummary { key: format!("{key}/"), size: 0, last_modified: DateTime::default() });
                }
                continue;
            }
            let meta = Self::meta_of(entry.path())?;
            objects.push(ObjectSummary { key, size: meta.size, last_modified: meta.last_modified });
        }
        Ok(paginate(req.bucket, objects, req))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<(Vec<u8>, ObjectMeta)> {
        let path = self.object_path(bucket, key)?;
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        Ok((bytes, Self::meta_of(&path)?))
    }

    fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<ObjectMeta> {
        let path = self.object_path(bucket, key)?;
        let meta = Self::meta_of(&path)?;
        fs::copy(&path, dest).with_context(|| format!("copy {} -> {}", path.display(), dest.display()))?;
        Ok(meta)
    }
}

// ----------------------------- In memory ----------------------------------

#[derive(Clone, Debug)]
struct StoredObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Objects in memory. Every write advances a private clock by one second, so each put or
/// append yields a new, distinct modification time.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    clock: AtomicI64,
    gets: AtomicUsize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock: AtomicI64::new(1_420_070_400), // 2015-01-01T00:00:00Z
            gets: AtomicUsize::new(0),
        }
    }

    fn tick(&self) -> DateTime<Utc> {
        let secs = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    /// Create or replace an object.
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) -> DateTime<Utc> {
        let modified = self.tick();
        self.put_with_modified(bucket, key, data, modified);
        modified
    }

    pub fn put_with_modified(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), StoredObject { data: data.into(), modified });
    }

    /// Append to an object (creating it if missing).
    pub fn append(&self, bucket: &str, key: &str, data: &[u8]) -> DateTime<Utc> {
        let modified = self.tick();
        let mut objects = self.objects.write();
        let obj = objects
            .entry((bucket.to_string(), key.to_string()))
            .or_insert_with(|| StoredObject { data: Vec::new(), modified });
        obj.data.extend_from_slice(data);
        obj.modified = modified;
        modified
    }

    /// Delete an object; false if it did not exist.
    pub fn remove(&self, bucket: &str, key: &str) -> bool {
        self.objects.write().remove(&(bucket.to_string(), key.to_string())).is_some()
    }

    /// Number of `get`/`download_to` calls served so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, req: &ListRequest<'_>) -> Result<ListPage> {
        let objects = self.objects.read();
        let summaries: Vec<ObjectSummary> = objects
            .iter()
            .filter(|((b, k), _)| b == req.bucket && k.starts_with(req.prefix))
            .map(|((_, k), o)| ObjectSummary { key: k.clone(), size: o.data.len() as u64, last_modified: o.modified })
            .collect();
        Ok(paginate(req.bucket, summaries, req))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<(Vec<u8>, ObjectMeta)> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read();
        let obj = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| anyhow!("no such key: {bucket}/{key}"))?;
        Ok((obj.data.clone(), ObjectMeta { size: obj.data.len() as u64, last_modified: obj.modified }))
    }
}
