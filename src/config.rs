use crate::date::{DateCondition, TimestampSpec, Zone, MAX_DATE_CONDITIONS};
use crate::error::ConfigError;
use crate::pattern::{compile_delimited, compile_optional, Pattern};
use crate::util::ensure_writable_dir;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SQLite durability trade-off for the offset store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// WAL journal, `synchronous=FULL`: a committed offset survives a crash.
    #[default]
    Durable,
    /// In-memory journal, `synchronous=OFF`: faster, but a crash can lose or corrupt recent commits.
    Relaxed,
}

/// User-facing options with sensible defaults and builder chaining.
/// Deserializable from JSON; every field is optional there.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PollerOptions {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    pub bucket: String,
    pub prefix: String,
    pub key_format: Option<String>,         // `/.../`, inclusion filter
    pub key_exclude_format: Option<String>, // `/.../`, exclusion filter
    pub key_current_format: Option<String>, // `/.../`, marks the live tail object
    pub date_conditions: Vec<String>,       // `<group> <format> <op> <bound>`

    pub format: String,                   // `/.../` with named captures
    pub multiline: bool,
    pub format_firstline: Option<String>, // `/.../`, start of a logical record
    pub tag: String,
    pub timestamp: Option<String>,        // `<group> [<format>]`
    pub timezone: String,

    pub work_dir: PathBuf,
    pub clear_db_at_start: bool,
    pub durability: Durability,

    pub refresh_interval_secs: u64,
    pub start_now: bool,
    pub shutdown_timeout_secs: u64,

    pub add_instance_tags: bool,

    pub download_threads: usize,
    pub parse_threads: usize,
    pub list_page_size: usize,
    pub progress: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            region: None,
            access_key_id: None,
            secret_access_key: None,

            bucket: String::new(),
            prefix: String::new(),
            key_format: None,
            key_exclude_format: None,
            key_current_format: None,
            date_conditions: Vec::new(),

            format: String::new(),
            multiline: false,
            format_firstline: None,
            tag: "s3in.log".to_string(),
            timestamp: None,
            timezone: "UTC".to_string(),

            work_dir: PathBuf::from("./bucketail_work"),
            clear_db_at_start: false,
            durability: Durability::Durable,

            refresh_interval_secs: 300,
            start_now: false,
            shutdown_timeout_secs: 30,

            add_instance_tags: false,

            download_threads: 5,
            parse_threads: 5,
            list_page_size: 1000,
            progress: false,
        }
    }
}

impl PollerOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
    pub fn with_credentials(mut self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.access_key_id = Some(key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
    pub fn with_key_format(mut self, pattern: impl Into<String>) -> Self {
        self.key_format = Some(pattern.into());
        self
    }
    pub fn with_key_exclude_format(mut self, pattern: impl Into<String>) -> Self {
        self.key_exclude_format = Some(pattern.into());
        self
    }
    pub fn with_key_current_format(mut self, pattern: impl Into<String>) -> Self {
        self.key_current_format = Some(pattern.into());
        self
    }
    pub fn with_date_condition(mut self, condition: impl Into<String>) -> Self {
        self.date_conditions.push(condition.into());
        self
    }
    pub fn with_format(mut self, pattern: impl Into<String>) -> Self {
        self.format = pattern.into();
        self
    }
    pub fn with_multiline(mut self, yes: bool) -> Self {
        self.multiline = yes;
        self
    }
    pub fn with_format_firstline(mut self, pattern: impl Into<String>) -> Self {
        self.format_firstline = Some(pattern.into());
        self
    }
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
    pub fn with_timestamp(mut self, spec: impl Into<String>) -> Self {
        self.timestamp = Some(spec.into());
        self
    }
    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_clear_db_at_start(mut self, yes: bool) -> Self {
        self.clear_db_at_start = yes;
        self
    }
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
    pub fn with_refresh_interval(mut self, secs: u64) -> Self {
        self.refresh_interval_secs = secs.max(1);
        self
    }
    pub fn with_start_now(mut self, yes: bool) -> Self {
        self.start_now = yes;
        self
    }
    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }
    pub fn with_instance_tags(mut self, yes: bool) -> Self {
        self.add_instance_tags = yes;
        self
    }
    pub fn with_threads(mut self, download: usize, parse: usize) -> Self {
        self.download_threads = download;
        self.parse_threads = parse;
        self
    }
    pub fn with_list_page_size(mut self, n: usize) -> Self {
        self.list_page_size = n.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
}

/// Static credentials for remote object-store backends; `None` in `Settings` means ambient
/// (role) credentials. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Validated, compiled configuration. Built once; polling never re-validates.
#[derive(Clone, Debug)]
pub struct Settings {
    pub region: Option<String>,
    pub credentials: Option<Credentials>,
    pub bucket: String,
    pub prefix: String,
    pub key_format: Option<Pattern>,
    pub key_exclude_format: Option<Pattern>,
    pub key_current_format: Option<Pattern>,
    pub date_conditions: Vec<DateCondition>,
    pub format: Pattern,
    pub multiline: bool,
    pub format_firstline: Option<Pattern>,
    pub tag: String,
    pub timestamp: Option<TimestampSpec>,
    pub zone: Zone,
    pub work_dir: PathBuf,
    pub clear_db_at_start: bool,
    pub durability: Durability,
    pub refresh_interval: Duration,
    pub start_now: bool,
    pub shutdown_timeout: Duration,
    pub add_instance_tags: bool,
    pub download_threads: usize,
    pub parse_threads: usize,
    pub list_page_size: usize,
    pub progress: bool,
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn with_end_slash(s: &str) -> String {
    if s.ends_with('/') { s.to_string() } else { format!("{s}/") }
}

impl Settings {
    pub fn from_options(opts: PollerOptions) -> Result<Self, ConfigError> {
        let credentials = match (non_blank(opts.access_key_id), non_blank(opts.secret_access_key)) {
            (Some(access_key_id), Some(secret_access_key)) => {
                Some(Credentials { access_key_id, secret_access_key })
            }
            (None, None) => None,
            _ => return Err(ConfigError::PartialCredentials),
        };

        let bucket = opts.bucket.trim().to_string();
        if bucket.is_empty() {
            return Err(ConfigError::Missing("bucket"));
        }
        if opts.prefix.trim().is_empty() {
            return Err(ConfigError::Missing("prefix"));
        }
        let prefix = with_end_slash(opts.prefix.trim());

        let zone: Zone = opts.timezone.parse()?;

        if opts.date_conditions.len() > MAX_DATE_CONDITIONS {
            return Err(ConfigError::TooManyDateConditions(opts.date_conditions.len()));
        }
        let date_conditions = opts
            .date_conditions
            .iter()
            .enumerate()
            .map(|(i, raw)| DateCondition::parse(i + 1, raw, &zone))
            .collect::<Result<Vec<_>, _>>()?;
        // Relative bounds must stay representable when added to the poll time.
        let probe_time = Utc::now();
        if let Some((i, cond)) = date_conditions
            .iter()
            .enumerate()
            .find(|(_, c)| c.bound.resolve(probe_time).is_none())
        {
            return Err(ConfigError::DateCondition {
                index: i + 1,
                reason: format!("bound {:?} is out of range", cond.bound),
            });
        }

        let key_format_src = non_blank(opts.key_format);
        if !date_conditions.is_empty() && key_format_src.is_none() {
            return Err(ConfigError::Missing("key_format (date conditions are set)"));
        }
        let key_format =
            compile_optional(key_format_src.as_deref(), opts.multiline, !date_conditions.is_empty())?;
        if let Some(kf) = &key_format {
            if let Some((i, c)) = date_conditions.iter().enumerate().find(|(_, c)| !kf.has_name(&c.group)) {
                return Err(ConfigError::DateCondition {
                    index: i + 1,
                    reason: format!("group '{}' is not a named capture of key_format", c.group),
                });
            }
        }
        let key_exclude_format = compile_optional(opts.key_exclude_format.as_deref(), opts.multiline, false)?;
        let key_current_format = compile_optional(opts.key_current_format.as_deref(), opts.multiline, false)?;

        if opts.format.trim().is_empty() {
            return Err(ConfigError::Missing("format"));
        }
        let format = compile_delimited(opts.format.trim(), opts.multiline, true)?;
        let format_firstline = compile_optional(opts.format_firstline.as_deref(), opts.multiline, false)?;

        let timestamp = match non_blank(opts.timestamp) {
            Some(raw) => {
                let spec: TimestampSpec = raw.parse()?;
                if !format.has_name(&spec.group) {
                    return Err(ConfigError::UnknownTimestampGroup(spec.group));
                }
                Some(spec)
            }
            None => None,
        };

        if opts.download_threads == 0 {
            return Err(ConfigError::ZeroThreads("download_threads"));
        }
        if opts.parse_threads == 0 {
            return Err(ConfigError::ZeroThreads("parse_threads"));
        }

        if opts.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("work_dir"));
        }
        ensure_writable_dir(&opts.work_dir).map_err(|e| ConfigError::WorkDir {
            path: opts.work_dir.clone(),
            reason: format!("{e:#}"),
        })?;

        Ok(Self {
            region: non_blank(opts.region),
            credentials,
            bucket,
            prefix,
            key_format,
            key_exclude_format,
            key_current_format,
            date_conditions,
            format,
            multiline: opts.multiline,
            format_firstline,
            tag: opts.tag,
            timestamp,
            zone,
            work_dir: opts.work_dir,
            clear_db_at_start: opts.clear_db_at_start,
            durability: opts.durability,
            refresh_interval: Duration::from_secs(opts.refresh_interval_secs.max(1)),
            start_now: opts.start_now,
            shutdown_timeout: Duration::from_secs(opts.shutdown_timeout_secs),
            add_instance_tags: opts.add_instance_tags,
            download_threads: opts.download_threads,
            parse_threads: opts.parse_threads,
            list_page_size: opts.list_page_size.max(1),
            progress: opts.progress,
        })
    }
}
