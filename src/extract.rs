//! Turning a downloaded object into records: decompression, boundary lines, record
//! segmentation, field extraction, and the per-record emit + offset commit.

use crate::config::Settings;
use crate::date::parse_time;
use crate::error::ObjectError;
use crate::paths::{tail_stream, Compression, ScratchFiles};
use crate::sink::{Record, RecordSink};
use crate::store::{ObjectRecord, OffsetStore, Progress};
use crate::tags::{TagCache, TagDirectory, INSTANCE_ID_FIELD};
use crate::util::{create_with_backoff, open_with_backoff, remove_with_backoff};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const READ_BUF_BYTES: usize = 256 * 1024;
const BACKSCAN_CHUNK: u64 = 8 * 1024;

// ----------------------------- Decompression ------------------------------------

/// Inflate the compressed download into the plain scratch file and drop the compressed copy.
/// No-op for uncompressed objects.
pub fn decompress(scratch: &ScratchFiles) -> Result<(), ObjectError> {
    let wrap = |source: io::Error| ObjectError::Decompress { path: scratch.download.clone(), source };

    if scratch.compression == Compression::None {
        return Ok(());
    }
    let input = open_with_backoff(&scratch.download, 16, 50).map_err(wrap)?;
    let mut reader: Box<dyn Read> = match scratch.compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(input))),
        Compression::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(input).map_err(wrap)?;
            // Large windows are common in log archives; accept up to 2 GiB.
            decoder.window_log_max(31).map_err(wrap)?;
            Box::new(decoder)
        }
        Compression::None => Box::new(input),
    };
    let out = create_with_backoff(&scratch.plain, 16, 50).map_err(wrap)?;
    let mut writer = BufWriter::with_capacity(READ_BUF_BYTES, out);
    io::copy(&mut reader, &mut writer).map_err(wrap)?;
    writer.flush().map_err(wrap)?;
    drop(reader);

    if let Err(e) = remove_with_backoff(&scratch.download, 16, 50) {
        tracing::warn!("could not remove compressed scratch file: {e:#}");
    }
    Ok(())
}

// ----------------------------- Boundary lines ------------------------------------

fn trim_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

/// The file's first line and the line that ends at the resume offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Boundaries {
    pub first_line: Option<String>,
    /// The last line before `position`; the first line when `position` falls inside it.
    pub resume_line: Option<String>,
}

pub fn boundary_lines(path: &Path, position: u64) -> io::Result<Boundaries> {
    let mut file = open_with_backoff(path, 16, 50)?;
    let mut first = Vec::new();
    let first_len = BufReader::new(&mut file).read_until(b'\n', &mut first)? as u64;
    if first_len == 0 {
        return Ok(Boundaries::default());
    }
    let first_line = Some(trim_newline(String::from_utf8_lossy(&first).into_owned()));
    if position <= first_len {
        return Ok(Boundaries { resume_line: first_line.clone(), first_line });
    }
    let resume_line = line_ending_at(&mut file, position)?;
    Ok(Boundaries { first_line, resume_line })
}

/// Scan backwards from `end` to the previous newline and return the line in between.
fn line_ending_at(file: &mut File, end: u64) -> io::Result<Option<String>> {
    let end = end.min(file.metadata()?.len());
    if end == 0 {
        return Ok(None);
    }
    let mut tail: Vec<u8> = Vec::new();
    let mut start = end;
    loop {
        let from = start.saturating_sub(BACKSCAN_CHUNK);
        let mut chunk = vec![0u8; (start - from) as usize];
        file.seek(SeekFrom::Start(from))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
        start = from;
        // The byte right before `end` is the line's own terminator.
        if let Some(i) = tail[..tail.len() - 1].iter().rposition(|b| *b == b'\n') {
            tail.drain(..=i);
            break;
        }
        if start == 0 {
            break;
        }
    }
    Ok(Some(trim_newline(String::from_utf8_lossy(&tail).into_owned())))
}

// ----------------------------- Extraction ------------------------------------

/// Result of reading one object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub emitted: u64,
    /// False when shutdown interrupted the read.
    pub completed: bool,
}

/// Shared, read-only collaborators of every parse worker.
pub struct LineExtractor<'a> {
    settings: &'a Settings,
    offsets: &'a OffsetStore,
    sink: &'a dyn RecordSink,
    tags: Option<&'a dyn TagDirectory>,
    shutdown: &'a AtomicBool,
    emitted: &'a AtomicU64,
}

/// Per-object read state.
struct ObjectRead<'r> {
    record: &'r mut ObjectRecord,
    predecessor: Option<i64>,
    emitted: u64,
}

impl<'a> LineExtractor<'a> {
    pub fn new(
        settings: &'a Settings,
        offsets: &'a OffsetStore,
        sink: &'a dyn RecordSink,
        tags: Option<&'a dyn TagDirectory>,
        shutdown: &'a AtomicBool,
        emitted: &'a AtomicU64,
    ) -> Self {
        Self { settings, offsets, sink, tags, shutdown, emitted }
    }

    #[inline]
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Read `path` (the plain-text copy of `record`'s object) from `record.position`, emitting
    /// and committing one record at a time. `record` is kept in step with what was committed.
    pub fn extract(&self, path: &Path, record: &mut ObjectRecord) -> Result<ExtractOutcome, ObjectError> {
        let read_err = |source: io::Error| ObjectError::Read { path: path.to_path_buf(), source };

        let bounds = boundary_lines(path, record.position).map_err(read_err)?;
        let file_len = std::fs::metadata(path).map_err(read_err)?.len();
        if record.position > file_len {
            tracing::warn!(
                bucket = %record.bucket, key = %record.key, position = record.position, len = file_len,
                "object is shorter than the stored position; nothing to read"
            );
        } else if record.position > 0
            && record.last_line.is_some()
            && bounds.resume_line != record.last_line
        {
            tracing::warn!(
                bucket = %record.bucket, key = %record.key, position = record.position,
                "content before the stored position changed; only appends are tracked"
            );
        }
        record.first_line = bounds.first_line;

        if self.stopping() {
            return Ok(ExtractOutcome::default());
        }

        let predecessor = {
            let current = self.settings.key_current_format.as_ref();
            let stream = tail_stream(current, &record.key);
            self.offsets
                .find_rotation_predecessor(record, |prev| tail_stream(current, &prev.key) == stream)?
        };
        if let Some(prev) = &predecessor {
            tracing::info!(
                bucket = %record.bucket, key = %record.key, previous = %prev.key,
                "rotation detected; previous tail object will be reset"
            );
        }

        let file = open_with_backoff(path, 16, 50).map_err(read_err)?;
        let mut reader = BufReader::with_capacity(READ_BUF_BYTES, file);
        reader.seek(SeekFrom::Start(record.position)).map_err(read_err)?;

        let mut state = ObjectRead { predecessor: predecessor.map(|p| p.id), record, emitted: 0 };
        let mut tag_cache = match (self.settings.add_instance_tags, self.tags) {
            (true, Some(dir)) => Some(TagCache::new(dir)),
            _ => None,
        };
        let completed = self.read_records(&mut reader, &mut state, &mut tag_cache).map_err(|e| match e {
            ReadFailure::Io(source) => read_err(source),
            ReadFailure::Object(e) => e,
        })?;

        if completed {
            self.offsets.finish_object(state.record)?;
        }
        Ok(ExtractOutcome { emitted: state.emitted, completed })
    }

    /// Segment the stream into records. Returns false if shutdown cut the read short.
    fn read_records<R: BufRead>(
        &self,
        reader: &mut R,
        state: &mut ObjectRead<'_>,
        tags: &mut Option<TagCache<'_>>,
    ) -> Result<bool, ReadFailure> {
        let multiline = self.settings.multiline;
        let firstline = self.settings.format_firstline.as_ref();

        let mut cursor = state.record.position;
        let mut raw = Vec::with_capacity(16 * 1024);
        // Multiline accumulation: text of the pending record, its last line, and where it ends.
        let mut pending = String::new();
        let mut pending_last = String::new();
        let mut pending_end = cursor;

        loop {
            if self.stopping() {
                return Ok(false);
            }
            raw.clear();
            let n = reader.read_until(b'\n', &mut raw).map_err(ReadFailure::Io)?;
            if n == 0 {
                break;
            }
            cursor += n as u64;
            let line = String::from_utf8_lossy(&raw).into_owned();

            if !multiline {
                let text = trim_newline(line);
                self.try_emit(&text, &text, cursor, state, tags)?;
                continue;
            }

            if let Some(first) = firstline {
                let starts_record = first.is_match(trim_newline(line.clone()).as_str());
                if starts_record && !pending.is_empty() {
                    let text = std::mem::take(&mut pending);
                    self.try_emit(trim_end_newline(&text), &pending_last, pending_end, state, tags)?;
                }
                pending.push_str(&line);
                pending_last = trim_newline(line);
                pending_end = cursor;
            } else {
                pending.push_str(&line);
                let last = trim_newline(line);
                if self.try_emit(trim_end_newline(&pending), &last, cursor, state, tags)? {
                    pending.clear();
                }
            }
        }

        if firstline.is_some() && !pending.is_empty() && !self.stopping() {
            if state.record.current {
                // A live tail may still grow this record; the next read resumes at its first line.
                tracing::trace!(key = %state.record.key, position = state.record.position, "holding open record");
            } else {
                self.try_emit(trim_end_newline(&pending), &pending_last, pending_end, state, tags)?;
            }
        }
        Ok(true)
    }

    /// Match `text` against the line format; on a match emit it and commit `position`.
    fn try_emit(
        &self,
        text: &str,
        last_line: &str,
        position: u64,
        state: &mut ObjectRead<'_>,
        tags: &mut Option<TagCache<'_>>,
    ) -> Result<bool, ReadFailure> {
        let Some(out) = self.build_record(text, tags) else {
            tracing::trace!(key = %state.record.key, position, "no match");
            return Ok(false);
        };
        let (rec, time) = out;

        let progress = Progress { position, last_line, first_line: state.record.first_line.as_deref() };
        let predecessor = state.predecessor.take();
        self.offsets
            .commit_record(state.record, &progress, predecessor, || {
                self.sink.emit(&self.settings.tag, time, &rec).map_err(ObjectError::Emit)
            })
            .map_err(ReadFailure::Object)?;

        state.record.position = state.record.position.max(position);
        state.record.last_line = Some(last_line.to_string());
        state.emitted += 1;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Captures → record fields, timestamp and enrichment.
    fn build_record(&self, text: &str, tags: &mut Option<TagCache<'_>>) -> Option<(Record, DateTime<Utc>)> {
        let format = &self.settings.format;
        let caps = format.regex().captures(text)?;

        let mut rec = Record::default();
        for name in format.names() {
            if let Some(m) = caps.name(name) {
                rec.fields.insert(name.clone(), m.as_str().to_string());
            }
        }

        let time = match &self.settings.timestamp {
            Some(spec) => match rec.fields.get(&spec.group) {
                Some(value) => parse_time(value, spec.format.as_deref(), &self.settings.zone)
                    .unwrap_or_else(|e| {
                        tracing::warn!(value = %value, "timestamp parse failed, using current time: {e:#}");
                        Utc::now()
                    }),
                None => Utc::now(),
            },
            None => Utc::now(),
        };

        if let (Some(cache), Some(id)) = (tags.as_mut(), rec.fields.get(INSTANCE_ID_FIELD)) {
            if let Some(found) = cache.lookup(id) {
                for (k, v) in found {
                    if !rec.fields.contains_key(k) {
                        rec.extensions.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Some((rec, time))
    }
}

fn trim_end_newline(s: &str) -> &str {
    s.strip_suffix('\n').map(|s| s.strip_suffix('\r').unwrap_or(s)).unwrap_or(s)
}

enum ReadFailure {
    Io(io::Error),
    Object(ObjectError),
}
