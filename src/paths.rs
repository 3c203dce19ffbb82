use crate::config::Settings;
use crate::date::{DateCondition, Zone};
use crate::object_store::{ListRequest, ObjectStore};
use crate::pattern::Pattern;
use crate::store::{ObjectRecord, OffsetStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const DELIMITER: &str = "/";

/// An object as seen in the current listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub current: bool,
}

/// Key inclusion / exclusion / date rules, and the live-tail marker.
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    include: Option<Pattern>,
    exclude: Option<Pattern>,
    current: Option<Pattern>,
    conditions: Vec<DateCondition>,
    zone: Zone,
}

impl KeyFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            include: settings.key_format.clone(),
            exclude: settings.key_exclude_format.clone(),
            current: settings.key_current_format.clone(),
            conditions: settings.date_conditions.clone(),
            zone: settings.zone,
        }
    }

    /// `None` if the key is filtered out, otherwise whether it is a current (tail) object.
    pub fn classify(&self, key: &str, now: DateTime<Utc>) -> Option<bool> {
        if let Some(include) = &self.include {
            let caps = include.regex().captures(key)?;
            for cond in &self.conditions {
                let value = caps.name(&cond.group).map(|m| m.as_str());
                match cond.evaluate(value, now, &self.zone) {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        tracing::warn!(key, group = %cond.group, "skipping key, date condition failed: {e:#}");
                        return None;
                    }
                }
            }
        }
        if self.exclude.as_ref().is_some_and(|p| p.is_match(key)) {
            return None;
        }
        Some(self.current.as_ref().is_some_and(|p| p.is_match(key)))
    }
}

/// Values of the named captures of `current` in `key`: the identity of the tail stream a
/// current object belongs to. Without named captures every current object is one stream.
pub fn tail_stream<'k>(current: Option<&Pattern>, key: &'k str) -> Vec<Option<&'k str>> {
    let Some(pattern) = current else { return Vec::new() };
    let Some(caps) = pattern.regex().captures(key) else { return Vec::new() };
    pattern
        .names()
        .iter()
        .map(|name| caps.name(name).map(|m| m.as_str()))
        .collect()
}

/// Lazy walk of a prefix tree. Yields every listed object that passes the `KeyFilter`.
///
/// Listing pages of one prefix are followed before descending into the pseudo-directories
/// that page reported; each page's common prefixes are visited once.
pub struct ObjectWalker<'a> {
    store: &'a dyn ObjectStore,
    bucket: &'a str,
    root: String,
    filter: &'a KeyFilter,
    now: DateTime<Utc>,
    page_size: usize,
    shutdown: Option<&'a AtomicBool>,
    pending: VecDeque<(String, Option<String>)>,
    ready: VecDeque<ObservedObject>,
}

impl<'a> ObjectWalker<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        bucket: &'a str,
        prefix: &str,
        filter: &'a KeyFilter,
        now: DateTime<Utc>,
        page_size: usize,
    ) -> Self {
        let mut walker = Self {
            store,
            bucket,
            root: prefix.to_string(),
            filter,
            now,
            page_size: page_size.max(1),
            shutdown: None,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
        };
        walker.restart();
        walker
    }

    /// Stop yielding once `flag` is set.
    pub fn with_shutdown(mut self, flag: &'a AtomicBool) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Start over from the root prefix.
    pub fn restart(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.pending.push_back((self.root.clone(), None));
    }

    fn fetch(&mut self, prefix: String, marker: Option<String>) -> Result<()> {
        let page = self
            .store
            .list(&ListRequest {
                bucket: self.bucket,
                prefix: &prefix,
                delimiter: Some(DELIMITER),
                marker: marker.as_deref(),
                max_keys: self.page_size,
            })
            .with_context(|| format!("list {}/{}", self.bucket, prefix))?;

        for entry in &page.entries {
            if entry.size == 0 || entry.key.ends_with(DELIMITER) {
                continue;
            }
            let Some(current) = self.filter.classify(&entry.key, self.now) else { continue };
            self.ready.push_back(ObservedObject {
                bucket: page.bucket.clone(),
                key: entry.key.clone(),
                size: entry.size,
                modified: entry.last_modified,
                current,
            });
        }

        if page.truncated {
            let next = page
                .next_marker
                .clone()
                .or_else(|| page.entries.last().map(|e| e.key.clone()));
            if let Some(next) = next {
                self.pending.push_front((prefix, Some(next)));
            }
        }
        self.pending.extend(page.common_prefixes.into_iter().map(|p| (p, None)));
        Ok(())
    }
}

impl Iterator for ObjectWalker<'_> {
    type Item = Result<ObservedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.shutdown.is_some_and(|f| f.load(Ordering::SeqCst)) {
                return None;
            }
            if let Some(obj) = self.ready.pop_front() {
                return Some(Ok(obj));
            }
            let (prefix, marker) = self.pending.pop_front()?;
            if let Err(e) = self.fetch(prefix, marker) {
                return Some(Err(e));
            }
        }
    }
}

/// Walk the configured bucket/prefix with the settings' filter.
pub fn list_candidates<'a>(
    store: &'a dyn ObjectStore,
    settings: &'a Settings,
    filter: &'a KeyFilter,
    now: DateTime<Utc>,
) -> ObjectWalker<'a> {
    ObjectWalker::new(store, &settings.bucket, &settings.prefix, filter, now, settings.list_page_size)
}

/// Reconcile observed objects with the offset store; returns this cycle's worklist.
pub fn diff_against_store(
    offsets: &OffsetStore,
    observed: impl IntoIterator<Item = Result<ObservedObject>>,
) -> Result<Vec<ObjectRecord>> {
    let mut work = Vec::new();
    for obj in observed {
        let obj = obj?;
        if let Some(record) = offsets
            .reconcile_candidate(&obj)
            .with_context(|| format!("reconcile {}/{}", obj.bucket, obj.key))?
        {
            tracing::debug!(bucket = %record.bucket, key = %record.key, position = record.position, "queued");
            work.push(record);
        }
    }
    Ok(work)
}

// ----------------------------- Scratch files ----------------------------------

/// How an object is stored at the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn from_key(key: &str) -> Self {
        if key.ends_with(".gz") {
            Compression::Gzip
        } else if key.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    fn suffix(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
        }
    }
}

/// Local scratch location for one object: `<work_dir>/<md5(bucket/key)>` for the plain text,
/// plus a `.gz` / `.zst` sibling for the compressed download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchFiles {
    pub plain: PathBuf,
    pub download: PathBuf,
    pub compression: Compression,
}

impl ScratchFiles {
    pub fn for_object(work_dir: &Path, bucket: &str, key: &str) -> Self {
        let digest = format!("{:x}", md5::compute(format!("{bucket}/{key}")));
        let plain = work_dir.join(digest);
        let compression = Compression::from_key(key);
        let download = match compression.suffix() {
            Some(ext) => plain.with_extension(ext),
            None => plain.clone(),
        };
        Self { plain, download, compression }
    }
}
