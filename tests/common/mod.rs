#![allow(dead_code)]

use bucketail::{CollectingSink, MemoryObjectStore, Poller, PollerOptions, Settings};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const BUCKET: &str = "logs";
pub const PREFIX: &str = "app/";

/// `<time> <level> <message>` per line, e.g. `2015-01-01T00:00:00Z INFO started`.
pub const LINE_FORMAT: &str = r"/^(?P<time>\S+) (?P<level>[A-Z]+) (?P<message>.*)$/";

/// Options every test starts from: one bucket, one prefix, the line format above, small pools.
pub fn base_options(work_dir: &Path) -> PollerOptions {
    PollerOptions::default()
        .with_bucket(BUCKET)
        .with_prefix(PREFIX)
        .with_format(LINE_FORMAT)
        .with_work_dir(work_dir)
        .with_durability(bucketail::Durability::Relaxed)
        .with_threads(2, 2)
        .with_progress(false)
}

pub fn settings(opts: PollerOptions) -> Settings {
    Settings::from_options(opts).expect("valid settings")
}

/// In-memory store, collecting sink, and a poller over them, all sharing one temp work dir.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryObjectStore>,
    pub sink: Arc<CollectingSink>,
    pub poller: Poller,
}

impl Harness {
    pub fn new(configure: impl FnOnce(PollerOptions) -> PollerOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        Self::with_store(dir, store, configure)
    }

    /// Reopen on an existing work dir and store (simulates a restart).
    pub fn with_store(
        dir: TempDir,
        store: Arc<MemoryObjectStore>,
        configure: impl FnOnce(PollerOptions) -> PollerOptions,
    ) -> Self {
        let sink = Arc::new(CollectingSink::new());
        let opts = configure(base_options(dir.path()));
        let poller = Poller::new(settings(opts), store.clone(), sink.clone()).unwrap();
        Self { dir, store, sink, poller }
    }

    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.store.put(BUCKET, &format!("{PREFIX}{key}"), data);
    }

    pub fn append(&self, key: &str, data: &str) {
        self.store.append(BUCKET, &format!("{PREFIX}{key}"), data.as_bytes());
    }

    /// Message field of every record emitted so far, in order.
    pub fn messages(&self) -> Vec<String> {
        self.sink
            .snapshot()
            .into_iter()
            .map(|e| e.record.field("message").unwrap_or_default().to_string())
            .collect()
    }
}

/// `count` log lines with messages `<label>-<start>` .. `<label>-<start+count-1>`.
pub fn log_lines(label: &str, start: usize, count: usize) -> String {
    let mut out = String::new();
    for i in start..start + count {
        out.push_str(&format!("2015-01-01T00:00:{:02}Z INFO {label}-{i}\n", i % 60));
    }
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(data, 3).unwrap()
}
