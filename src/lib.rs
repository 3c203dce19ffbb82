mod config;
mod date;
mod error;
mod pattern;
mod paths;
mod store;
mod object_store;

mod extract;
mod sink;
mod tags;
mod progress;
mod concurrency;
mod util;
mod pipeline;

pub use crate::config::{Credentials, Durability, PollerOptions, Settings};
pub use crate::date::{parse_time, Bound, Comparison, DateCondition, TimestampSpec, Zone, MAX_DATE_CONDITIONS};
pub use crate::error::{ConfigError, ObjectError};
pub use crate::pattern::{compile_delimited, compile_optional, Pattern};
pub use crate::pipeline::{CycleSummary, Poller, Status};

// Listing, reconciliation and scratch naming, usable on their own.
pub use crate::paths::{diff_against_store, list_candidates, tail_stream, Compression, KeyFilter, ObjectWalker, ObservedObject, ScratchFiles, DELIMITER};
pub use crate::store::{pending_fingerprint, ObjectRecord, OffsetStore, Progress, DB_FILE_NAME};

// Object-store capability and the bundled backends.
pub use crate::object_store::{paginate, ListPage, ListRequest, LocalObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore, ObjectSummary};

// Extraction stage, for driving a single object by hand.
pub use crate::extract::{boundary_lines, decompress, Boundaries, ExtractOutcome, LineExtractor};

// Event sinks and instance-tag enrichment.
pub use crate::sink::{CollectingSink, Emitted, JsonLinesSink, Record, RecordSink};
pub use crate::tags::{StaticTagDirectory, TagCache, TagDirectory, INSTANCE_ID_FIELD};

pub use crate::concurrency::WorkerPool;
pub use crate::progress::{make_count_progress, CycleProgress};

//export robust file ops from util so binaries can import from crate root.
pub use crate::util::{init_tracing_once, open_with_backoff, create_with_backoff, remove_with_backoff};
