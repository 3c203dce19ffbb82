//! Where extracted records go.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;

/// One extracted record: the line format's captures plus enrichment fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Named captures that participated in the match.
    pub fields: BTreeMap<String, String>,
    /// Fields added from outside the line (instance tags). Never shadow a captured field.
    pub extensions: BTreeMap<String, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).or_else(|| self.extensions.get(name)).map(String::as_str)
    }

    /// Single mapping view; captured fields win on name clashes.
    pub fn flattened(&self) -> BTreeMap<&str, &str> {
        let mut out: BTreeMap<&str, &str> =
            self.extensions.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        out.extend(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        out
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let flat = self.flattened();
        let mut map = serializer.serialize_map(Some(flat.len()))?;
        for (k, v) in flat {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Host event sink. Implementations buffer internally and must not block indefinitely.
pub trait RecordSink: Send + Sync {
    fn emit(&self, tag: &str, time: DateTime<Utc>, record: &Record) -> Result<()>;
}

/// Writes one JSON object per record: `{"tag":..,"time":..,"record":{..}}`.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn emit(&self, tag: &str, time: DateTime<Utc>, record: &Record) -> Result<()> {
        let line = json!({
            "tag": tag,
            "time": time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "record": record,
        });
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, &line)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Emitted {
    pub tag: String,
    pub time: DateTime<Utc>,
    pub record: Record,
}

/// Keeps every record in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    emitted: Mutex<Vec<Emitted>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.emitted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Emitted> {
        self.emitted.lock().clone()
    }

    pub fn take(&self) -> Vec<Emitted> {
        std::mem::take(&mut *self.emitted.lock())
    }
}

impl RecordSink for CollectingSink {
    fn emit(&self, tag: &str, time: DateTime<Utc>, record: &Record) -> Result<()> {
        self.emitted.lock().push(Emitted { tag: tag.to_string(), time, record: record.clone() });
        Ok(())
    }
}
