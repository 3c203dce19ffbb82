use crate::concurrency::WorkerPool;
use crate::config::Settings;
use crate::error::ObjectError;
use crate::extract::{decompress, LineExtractor};
use crate::object_store::ObjectStore;
use crate::paths::{diff_against_store, list_candidates, KeyFilter, ScratchFiles};
use crate::progress::CycleProgress;
use crate::sink::RecordSink;
use crate::store::{ObjectRecord, OffsetStore};
use crate::tags::{TagDirectory, INSTANCE_ID_FIELD};
use crate::util::{init_tracing_once, remove_with_backoff};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Lifecycle of a poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Shutdown = 3,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Ready,
            1 => Status::Running,
            2 => Status::Waiting,
            _ => Status::Shutdown,
        }
    }
}

/// Counts for one poll cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Objects that needed work after reconciling the listing with the offset store.
    pub queued: u64,
    pub downloaded: u64,
    pub download_failed: u64,
    pub parsed: u64,
    pub parse_failed: u64,
    pub emitted: u64,
    /// Shutdown was requested before the cycle drained.
    pub interrupted: bool,
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicU64,
    download_failed: AtomicU64,
    parsed: AtomicU64,
    parse_failed: AtomicU64,
    emitted: AtomicU64,
}

struct Inner {
    settings: Settings,
    filter: KeyFilter,
    objects: Arc<dyn ObjectStore>,
    sink: Arc<dyn RecordSink>,
    tags: Option<Arc<dyn TagDirectory>>,
    offsets: OffsetStore,
    download_pool: WorkerPool,
    parse_pool: WorkerPool,
    shutdown: AtomicBool,
    status: AtomicU8,
    emitted: AtomicU64,
    // A timer-driven cycle and a direct `run_cycle` never overlap.
    cycle: Mutex<()>,
}

/// Background threads started by `Poller::start`.
struct Control {
    trigger: Sender<()>,
    stop_timer: Sender<()>,
    timer: JoinHandle<()>,
    driver: JoinHandle<()>,
    driver_done: Receiver<()>,
}

/// Incremental poller: lists the configured prefix, downloads what changed, and emits new
/// records from the stored position onwards.
pub struct Poller {
    inner: Arc<Inner>,
    control: Mutex<Option<Control>>,
}

impl Poller {
    pub fn new(settings: Settings, objects: Arc<dyn ObjectStore>, sink: Arc<dyn RecordSink>) -> Result<Self> {
        init_tracing_once();
        let offsets = OffsetStore::open(&settings.work_dir, settings.durability, settings.clear_db_at_start)
            .with_context(|| format!("open offset store in {}", settings.work_dir.display()))?;
        if settings.clear_db_at_start {
            tracing::info!(path = %offsets.path().display(), "offset store cleared");
        }
        if settings.add_instance_tags && !settings.format.has_name(INSTANCE_ID_FIELD) {
            tracing::warn!("add_instance_tags is set but format has no '{INSTANCE_ID_FIELD}' capture; records will not be tagged");
        }
        let download_pool = WorkerPool::new("download", settings.download_threads)?;
        let parse_pool = WorkerPool::new("parse", settings.parse_threads)?;
        for pool in [&download_pool, &parse_pool] {
            tracing::debug!(pool = pool.name(), threads = pool.size(), "worker pool ready");
        }
        let filter = KeyFilter::from_settings(&settings);
        let inner = Inner {
            settings,
            filter,
            objects,
            sink,
            tags: None,
            offsets,
            download_pool,
            parse_pool,
            shutdown: AtomicBool::new(false),
            status: AtomicU8::new(Status::Ready as u8),
            emitted: AtomicU64::new(0),
            cycle: Mutex::new(()),
        };
        Ok(Self { inner: Arc::new(inner), control: Mutex::new(None) })
    }

    /// Enrich records carrying an `instance_id` capture with the directory's tags.
    /// Has no effect once the poller is started.
    pub fn with_tag_directory(mut self, directory: Arc<dyn TagDirectory>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.tags = Some(directory),
            None => tracing::warn!("tag directory ignored: poller already started"),
        }
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn offsets(&self) -> &OffsetStore {
        &self.inner.offsets
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    /// Records emitted since construction.
    pub fn emit_count(&self) -> u64 {
        self.inner.emitted.load(Ordering::SeqCst)
    }

    /// Run one poll cycle on the calling thread.
    pub fn run_cycle(&self) -> Result<CycleSummary> {
        self.inner.run_cycle()
    }

    /// Start the refresh timer and the cycle driver. The first cycle runs immediately when
    /// `start_now` is set, otherwise after one refresh interval.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.is_some() {
            bail!("poller already started");
        }
        if self.inner.stopping() {
            bail!("poller is shut down");
        }

        // One pending trigger at most; ticks that land during a cycle collapse into it.
        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(1);
        if self.inner.settings.start_now {
            let _ = trigger_tx.try_send(());
        }

        let interval = self.inner.settings.refresh_interval;
        let tick = trigger_tx.clone();
        let timer = thread::Builder::new()
            .name("poll-timer".into())
            .spawn(move || {
                // Nothing is ever sent on `stop_rx`; dropping its sender ends the loop.
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    if let Err(TrySendError::Disconnected(())) = tick.try_send(()) {
                        break;
                    }
                }
            })
            .context("spawn timer thread")?;

        let inner = Arc::clone(&self.inner);
        let driver = thread::Builder::new()
            .name("poll-driver".into())
            .spawn(move || {
                for () in trigger_rx.iter() {
                    if inner.stopping() {
                        break;
                    }
                    if let Err(e) = inner.run_cycle() {
                        tracing::error!("poll cycle failed: {e:#}");
                    }
                }
                let _ = done_tx.send(());
            })
            .context("spawn driver thread")?;

        tracing::info!(
            bucket = %self.inner.settings.bucket,
            prefix = %self.inner.settings.prefix,
            interval_secs = interval.as_secs(),
            "poller started"
        );
        *control = Some(Control { trigger: trigger_tx, stop_timer: stop_tx, timer, driver, driver_done: done_rx });
        Ok(())
    }

    /// Ask for a cycle now instead of at the next tick. False if the poller is not running.
    pub fn trigger_now(&self) -> bool {
        match self.control.lock().as_ref() {
            Some(c) => !matches!(c.trigger.try_send(()), Err(TrySendError::Disconnected(()))),
            None => false,
        }
    }

    /// Stop workers at their next record or object boundary, wait up to `shutdown_timeout` for
    /// the driver, then close the offset store. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(c) = self.control.lock().take() {
            drop(c.stop_timer);
            drop(c.trigger);
            if c.timer.join().is_err() {
                tracing::error!("timer thread panicked");
            }
            let timeout = self.inner.settings.shutdown_timeout;
            match c.driver_done.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if c.driver.join().is_err() {
                        tracing::error!("driver thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "workers still busy at shutdown timeout; closing anyway");
                }
            }
        }
        self.inner.set_status(Status::Shutdown);
        self.inner.offsets.close().context("close offset store")?;
        tracing::info!(emitted = self.emit_count(), "poller shut down");
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.control.lock().is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!("shutdown on drop failed: {e:#}");
            }
        }
    }
}

impl Inner {
    #[inline]
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: Status) {
        // Shutdown is terminal.
        let _ = self.status.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            (cur != Status::Shutdown as u8).then_some(status as u8)
        });
    }

    fn run_cycle(&self) -> Result<CycleSummary> {
        let _cycle = self.cycle.lock();
        if self.stopping() {
            return Ok(CycleSummary { interrupted: true, ..Default::default() });
        }
        self.set_status(Status::Running);
        let started = Instant::now();
        let out = self.cycle_body();
        self.set_status(Status::Waiting);

        if let Ok(s) = &out {
            tracing::info!(
                queued = s.queued,
                downloaded = s.downloaded,
                download_failed = s.download_failed,
                parsed = s.parsed,
                parse_failed = s.parse_failed,
                emitted = s.emitted,
                interrupted = s.interrupted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "poll cycle finished"
            );
        }
        out
    }

    fn cycle_body(&self) -> Result<CycleSummary> {
        let now = Utc::now();
        let walker = list_candidates(&*self.objects, &self.settings, &self.filter, now).with_shutdown(&self.shutdown);
        let work = diff_against_store(&self.offsets, walker)?;

        let mut summary = CycleSummary { queued: work.len() as u64, ..Default::default() };
        if work.is_empty() {
            summary.interrupted = self.stopping();
            return Ok(summary);
        }
        tracing::debug!(objects = work.len(), "objects queued for download");

        let progress = CycleProgress::new(self.settings.progress, work.len() as u64);
        let counters = Counters::default();

        let (download_tx, download_rx) = unbounded::<ObjectRecord>();
        for record in work {
            // Receiver is alive in this scope.
            let _ = download_tx.send(record);
        }
        drop(download_tx);
        let (archive_tx, archive_rx) = unbounded::<ObjectRecord>();
        let (current_tx, current_rx) = unbounded::<ObjectRecord>();

        let counters_ref = &counters;
        let progress_ref = &progress;
        thread::scope(|s| {
            s.spawn(move || {
                let archive_tx = archive_tx;
                self.download_pool.run(|_| self.download_worker(&download_rx, &archive_tx, counters_ref));
                // archive_tx drops here: the parse stage sees the end of downloads.
            });

            // Archived objects are parsed as they arrive; live-tail objects wait for phase two.
            self.parse_pool.run(|_| {
                for record in archive_rx.iter() {
                    if self.stopping() {
                        break;
                    }
                    if record.current {
                        let _ = current_tx.send(record);
                    } else {
                        self.parse(record, counters_ref);
                        progress_ref.inc();
                    }
                }
            });
            drop(current_tx);

            self.parse_pool.run(|_| {
                for record in current_rx.iter() {
                    if self.stopping() {
                        break;
                    }
                    self.parse(record, counters_ref);
                    progress_ref.inc();
                }
            });
        });

        summary.downloaded = counters.downloaded.load(Ordering::SeqCst);
        summary.download_failed = counters.download_failed.load(Ordering::SeqCst);
        summary.parsed = counters.parsed.load(Ordering::SeqCst);
        summary.parse_failed = counters.parse_failed.load(Ordering::SeqCst);
        summary.emitted = counters.emitted.load(Ordering::SeqCst);
        summary.interrupted = self.stopping();
        progress.finish(format!("{} records", summary.emitted));
        Ok(summary)
    }

    fn download_worker(&self, queue: &Receiver<ObjectRecord>, archive: &Sender<ObjectRecord>, counters: &Counters) {
        for mut record in queue.iter() {
            if self.stopping() {
                break;
            }
            match self.download(&mut record) {
                Ok(()) => {
                    counters.downloaded.fetch_add(1, Ordering::Relaxed);
                    if archive.send(record).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    counters.download_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("{e:#}");
                }
            }
        }
    }

    fn download(&self, record: &mut ObjectRecord) -> Result<(), ObjectError> {
        let scratch = ScratchFiles::for_object(&self.settings.work_dir, &record.bucket, &record.key);
        remove_scratch(&scratch);
        match self.objects.download_to(&record.bucket, &record.key, &scratch.download) {
            Ok(meta) => {
                // The fetched bytes may be newer than the listing.
                record.size = meta.size;
                record.modified = meta.last_modified;
                tracing::debug!(bucket = %record.bucket, key = %record.key, size = meta.size, "downloaded");
                Ok(())
            }
            Err(source) => {
                remove_scratch(&scratch);
                Err(ObjectError::Download { bucket: record.bucket.clone(), key: record.key.clone(), source })
            }
        }
    }

    fn parse(&self, mut record: ObjectRecord, counters: &Counters) {
        let scratch = ScratchFiles::for_object(&self.settings.work_dir, &record.bucket, &record.key);
        let extractor = LineExtractor::new(
            &self.settings,
            &self.offsets,
            &*self.sink,
            self.tags.as_deref(),
            &self.shutdown,
            &self.emitted,
        );
        let result = decompress(&scratch).and_then(|()| extractor.extract(&scratch.plain, &mut record));
        match result {
            Ok(outcome) => {
                counters.parsed.fetch_add(1, Ordering::Relaxed);
                counters.emitted.fetch_add(outcome.emitted, Ordering::Relaxed);
                tracing::debug!(
                    bucket = %record.bucket, key = %record.key, emitted = outcome.emitted,
                    position = record.position, completed = outcome.completed, "parsed"
                );
            }
            Err(e) => {
                counters.parse_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(bucket = %record.bucket, key = %record.key, "parse failed: {e:#}");
            }
        }
        remove_scratch(&scratch);
    }
}

fn remove_scratch(scratch: &ScratchFiles) {
    for path in [&scratch.plain, &scratch.download] {
        if let Err(e) = remove_with_backoff(path, 16, 50) {
            tracing::warn!(path = %path.display(), "could not remove scratch file: {e:#}");
        }
    }
}
