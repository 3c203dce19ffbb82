//! Instance-tag enrichment: a directory capability plus a per-object lookup cache.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capture name whose value is looked up in the tag directory.
pub const INSTANCE_ID_FIELD: &str = "instance_id";

pub trait TagDirectory: Send + Sync {
    fn describe_tags(&self, instance_id: &str) -> Result<BTreeMap<String, String>>;
}

/// Fixed id → tags table. Unknown ids are an error, like a directory miss.
#[derive(Debug, Default)]
pub struct StaticTagDirectory {
    tags: HashMap<String, BTreeMap<String, String>>,
    lookups: AtomicUsize,
}

impl StaticTagDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance<I, K, V>(mut self, instance_id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(
            instance_id.into(),
            tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        );
        self
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl TagDirectory for StaticTagDirectory {
    fn describe_tags(&self, instance_id: &str) -> Result<BTreeMap<String, String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.tags
            .get(instance_id)
            .cloned()
            .ok_or_else(|| anyhow!("instance {instance_id} not found"))
    }
}

/// Lookups for one object. Failures are logged once and remembered as "no tags".
pub struct TagCache<'a> {
    directory: &'a dyn TagDirectory,
    cache: HashMap<String, Option<BTreeMap<String, String>>>,
}

impl<'a> TagCache<'a> {
    pub fn new(directory: &'a dyn TagDirectory) -> Self {
        Self { directory, cache: HashMap::new() }
    }

    pub fn lookup(&mut self, instance_id: &str) -> Option<&BTreeMap<String, String>> {
        let directory = self.directory;
        self.cache
            .entry(instance_id.to_string())
            .or_insert_with(|| match directory.describe_tags(instance_id) {
                Ok(tags) => Some(tags),
                Err(e) => {
                    tracing::warn!(instance_id, "tag lookup failed, record emitted without tags: {e:#}");
                    None
                }
            })
            .as_ref()
    }
}
