use std::path::PathBuf;
use thiserror::Error;

/// Startup validation failures. Raised once while building `Settings`, never during polling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("set both access_key_id and secret_access_key, or neither")]
    PartialCredentials,

    #[error("invalid regexp in format '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no named captures in format '{0}'")]
    NoNamedCaptures(String),

    #[error("date condition #{index} parse error: {reason}")]
    DateCondition { index: usize, reason: String },

    #[error("too many date conditions ({0}); at most {max} are supported", max = crate::date::MAX_DATE_CONDITIONS)]
    TooManyDateConditions(usize),

    #[error("timestamp group '{0}' not found in format")]
    UnknownTimestampGroup(String),

    #[error("invalid time format '{0}'")]
    InvalidTimeFormat(String),

    #[error("time format '{0}' uses %Z; zone names cannot be parsed, use %z or %:z")]
    ZoneNameInFormat(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid comparison operator '{0}'")]
    InvalidOperator(String),

    #[error("{0} must be at least 1")]
    ZeroThreads(&'static str),

    #[error("work_dir {path} is not usable: {reason}")]
    WorkDir { path: PathBuf, reason: String },
}

/// Per-object failures. The object is abandoned for the cycle; the pipeline keeps going.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("download of {bucket}/{key} failed: {source}")]
    Download {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("decompress {path} failed: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read {path} failed: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offset store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("sink rejected record: {0}")]
    Emit(#[source] anyhow::Error),
}
