//! Sharded, resumable crawl: shards of consecutive IDs are fed to a fixed
//! pool of workers, each owning its own store connection.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::db;
use crate::entity::EntityId;
use crate::error::{EmptyDocument, ParseError};
use crate::fetch::Fetcher;
use crate::journal::{AppendLog, Checkpoint, ErrorLog, ErrorSink};
use crate::parser::parse_document;
use crate::parser::registry::Registry;
use crate::parser::sections::Router;
use crate::persist::{Outcome, Persistence, SchemaCache};
use crate::session::{AttemptOutcome, HistoryEntry, SessionRecorder, TableStats};
use crate::settings::Settings;

/// A contiguous, half-open range of IDs `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Shard {
    pub fn ids(&self) -> impl Iterator<Item = EntityId> {
        (self.start..self.end).map(EntityId::new)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Partition `[start, start + total)` into shards of `size` IDs; the last may be shorter.
pub fn shards(start: u64, total: u64, size: u64) -> Vec<Shard> {
    let size = size.max(1);
    let end = start.saturating_add(total);
    let mut out = Vec::new();
    let mut lo = start;
    while lo < end {
        let hi = lo.saturating_add(size).min(end);
        out.push(Shard {
            index: out.len(),
            start: lo,
            end: hi,
        });
        lo = hi;
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by every worker of one run.
pub struct RunContext {
    pub settings: Settings,
    pub checkpoint: Checkpoint,
    pub processed: AppendLog,
    pub errors: Arc<dyn ErrorSink>,
    pub session: Arc<SessionRecorder>,
    pub schemas: Arc<SchemaCache>,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn open(settings: Settings) -> Result<Self> {
        let checkpoint = Checkpoint::open(&settings.checkpoint_path())
            .with_context(|| format!("Failed to open checkpoint {:?}", settings.checkpoint_path()))?;
        let processed = AppendLog::open(&settings.processed_path(), false)
            .with_context(|| format!("Failed to open {:?}", settings.processed_path()))?;
        let errors = ErrorLog::open(&settings.error_log_path())
            .with_context(|| format!("Failed to open {:?}", settings.error_log_path()))?;
        let session = SessionRecorder::create(&settings.sessions_dir(), settings.report_flush_every)?;
        info!(attempted = checkpoint.len(), session = ?session.path(), "Run context ready");
        Ok(Self {
            settings,
            checkpoint,
            processed,
            errors: Arc::new(errors),
            session: Arc::new(session),
            schemas: Arc::new(SchemaCache::default()),
            cancel: CancelFlag::default(),
        })
    }

    /// Send `err` to the error sink and the session report.
    pub fn record_error(&self, id: EntityId, origin: &str, err: &dyn Display) {
        self.errors.record(id, origin, err);
        self.session.record_error(&id.to_string(), origin, &err.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub shards: usize,
    pub attempted: u64,
    /// Already in the checkpoint.
    pub skipped: u64,
    pub stored: u64,
    pub empty: u64,
    pub failed: u64,
    pub cancelled: bool,
}

impl CrawlSummary {
    fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Skipped => self.skipped += 1,
            Attempt::Done(outcome) => {
                self.attempted += 1;
                match outcome {
                    AttemptOutcome::Stored => self.stored += 1,
                    AttemptOutcome::Empty => self.empty += 1,
                    AttemptOutcome::Failed => self.failed += 1,
                }
            }
        }
    }

    pub fn print(&self) {
        println!(
            "Attempted {} IDs across {} shards: {} stored, {} empty, {} failed, {} skipped (already checkpointed).",
            self.attempted, self.shards, self.stored, self.empty, self.failed, self.skipped
        );
        if self.cancelled {
            println!("Run was cancelled; remaining IDs will be picked up on the next run.");
        }
    }
}

impl AddAssign for CrawlSummary {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.skipped += other.skipped;
        self.stored += other.stored;
        self.empty += other.empty;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Skipped,
    Done(AttemptOutcome),
}

pub struct CrawlDriver<F> {
    ctx: Arc<RunContext>,
    fetcher: Arc<F>,
    registry: &'static Registry,
    progress: ProgressBar,
}

impl<F: Fetcher> CrawlDriver<F> {
    pub fn new(ctx: Arc<RunContext>, fetcher: F, registry: &'static Registry) -> Self {
        Self {
            ctx,
            fetcher: Arc::new(fetcher),
            registry,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Crawl the configured ID range. Per-ID failures are recorded and the
    /// run continues; only setup failures are returned as errors.
    pub async fn run(&self) -> Result<CrawlSummary> {
        let settings = &self.ctx.settings;
        let plan = shards(settings.start, settings.total, settings.shard_size);
        let mut summary = CrawlSummary {
            shards: plan.len(),
            ..Default::default()
        };
        info!(
            start = settings.start,
            total = settings.total,
            shards = plan.len(),
            workers = settings.workers,
            "Starting crawl"
        );

        let mut stores = Vec::with_capacity(settings.workers);
        for _ in 0..settings.workers {
            let conn = db::connect(&settings.db_path, settings.db_busy_timeout())?;
            stores.push(
                Persistence::new(
                    conn,
                    Arc::clone(&self.ctx.schemas),
                    &settings.entity_column,
                    settings.update_existing,
                )
                .with_session(Arc::clone(&self.ctx.session)),
            );
        }

        let t0 = Instant::now();
        let (tx, rx) = mpsc::channel::<Shard>(settings.workers);
        let queue = Arc::new(Mutex::new(rx));

        let cancel = self.ctx.cancel.clone();
        let feeder = tokio::spawn(async move {
            for shard in plan {
                if cancel.is_cancelled() || tx.send(shard).await.is_err() {
                    break;
                }
            }
        });

        let mut handles = Vec::with_capacity(stores.len());
        for (index, store) in stores.into_iter().enumerate() {
            let worker = Worker {
                index,
                ctx: Arc::clone(&self.ctx),
                fetcher: Arc::clone(&self.fetcher),
                registry: self.registry,
                store: Arc::new(std::sync::Mutex::new(store)),
                progress: self.progress.clone(),
            };
            handles.push(tokio::spawn(worker.run(Arc::clone(&queue))));
        }
        // workers hold the only receivers; once they stop, a blocked feeder errors out
        drop(queue);

        for handle in handles {
            match handle.await {
                Ok(worker_summary) => summary += worker_summary,
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
        if let Err(e) = feeder.await {
            error!(error = %e, "Shard feeder failed");
        }
        summary.cancelled |= self.ctx.cancel.is_cancelled();
        self.progress.finish_and_clear();

        let report = self.ctx.session.finish()?;
        info!(
            attempted = summary.attempted,
            stored = summary.stored,
            empty = summary.empty,
            failed = summary.failed,
            skipped = summary.skipped,
            success_rate = report.success_rate.unwrap_or(0.0),
            tables = self.ctx.schemas.len(),
            elapsed_secs = t0.elapsed().as_secs_f64(),
            "Crawl finished"
        );
        Ok(summary)
    }
}

struct Worker<F> {
    index: usize,
    ctx: Arc<RunContext>,
    fetcher: Arc<F>,
    registry: &'static Registry,
    store: Arc<std::sync::Mutex<Persistence>>,
    progress: ProgressBar,
}

impl<F: Fetcher> Worker<F> {
    async fn run(self, queue: Arc<Mutex<mpsc::Receiver<Shard>>>) -> CrawlSummary {
        let mut summary = CrawlSummary::default();
        loop {
            if self.ctx.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let next = queue.lock().await.recv().await;
            let Some(shard) = next else { break };
            debug!(worker = self.index, shard = shard.index, start = shard.start, ids = shard.len(), "Shard claimed");
            summary += self.run_shard(shard).await;
        }
        debug!(worker = self.index, "Worker finished");
        summary
    }

    async fn run_shard(&self, shard: Shard) -> CrawlSummary {
        let mut summary = CrawlSummary::default();
        for id in shard.ids() {
            if self.ctx.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.record(self.attempt(id).await);
            self.progress.inc(1);
        }
        info!(
            worker = self.index,
            shard = shard.index,
            stored = summary.stored,
            empty = summary.empty,
            failed = summary.failed,
            "Shard done"
        );
        summary
    }

    async fn attempt(&self, id: EntityId) -> Attempt {
        if self.ctx.checkpoint.contains(id) {
            return Attempt::Skipped;
        }
        if let Err(e) = self.ctx.checkpoint.mark_attempted(id) {
            // never fetch an ID that is not durably marked
            self.ctx.record_error(id, "checkpoint", &e);
            self.finish(id, AttemptOutcome::Failed, BTreeMap::new(), Some(e.to_string()));
            return Attempt::Done(AttemptOutcome::Failed);
        }

        let (outcome, tables, failure) = match self.fetcher.fetch(id).await {
            Err(e) => {
                self.ctx.record_error(id, "fetch", &e);
                (AttemptOutcome::Failed, BTreeMap::new(), Some(e.to_string()))
            }
            Ok(bytes) => {
                let ctx = Arc::clone(&self.ctx);
                let store = Arc::clone(&self.store);
                let registry = self.registry;
                let job = tokio::task::spawn_blocking(move || {
                    let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                    process(&ctx, registry, &mut store, id, &bytes)
                });
                match job.await {
                    Ok(Ok((outcome, tables))) => (outcome, tables, None),
                    Ok(Err(e)) => {
                        self.ctx.record_error(id, "parse", &e);
                        (AttemptOutcome::Failed, BTreeMap::new(), Some(e.to_string()))
                    }
                    Err(e) => {
                        self.ctx.record_error(id, "process", &e);
                        (AttemptOutcome::Failed, BTreeMap::new(), Some(e.to_string()))
                    }
                }
            }
        };
        self.finish(id, outcome, tables, failure);
        Attempt::Done(outcome)
    }

    fn finish(&self, id: EntityId, outcome: AttemptOutcome, tables: BTreeMap<String, TableStats>, error: Option<String>) {
        let mut entry = HistoryEntry::new(id.to_string(), outcome);
        entry.tables = tables;
        entry.error = error;
        self.ctx.session.record_attempt(entry);
        if let Err(e) = self.ctx.processed.append_line(&id.to_string()) {
            warn!(cvlac_id = %id, error = %e, "Failed to append to processed list");
        }
    }
}

/// Parse, route and persist one document. Blocking: runs on the blocking
/// pool, and the parsed tree never crosses an await.
fn process(
    ctx: &RunContext,
    registry: &Registry,
    store: &mut Persistence,
    id: EntityId,
    bytes: &[u8],
) -> Result<(AttemptOutcome, BTreeMap<String, TableStats>), ParseError> {
    let mut tables = BTreeMap::new();
    if bytes.len() < ctx.settings.min_document_bytes {
        debug!(cvlac_id = %id, bytes = bytes.len(), "Document below size threshold");
        return Ok((AttemptOutcome::Empty, tables));
    }

    let doc = parse_document(bytes)?;
    let router = Router::new(registry, &ctx.settings.entity_column);
    let routing = match router.route(&doc, id) {
        Ok(routing) => routing,
        Err(EmptyDocument) => {
            debug!(cvlac_id = %id, "No identification data");
            return Ok((AttemptOutcome::Empty, tables));
        }
    };

    for routed in routing {
        let origin = format!("extract:{}", routed.table);
        for warning in &routed.warnings {
            ctx.record_error(id, &origin, warning);
        }
        if !routed.has_data() {
            continue;
        }

        let report = store.upsert(&routed.table, &routed.record, routed.key_columns.as_deref());
        let origin = format!("persist:{}", routed.table);
        for column in &report.dropped_columns {
            let drift = format!("column `{}` is not in the table schema", column);
            ctx.record_error(id, &origin, &drift);
        }
        if let Outcome::Failed(e) = &report.outcome {
            ctx.record_error(id, &origin, e);
        }
        tables
            .entry(routed.table)
            .or_insert_with(TableStats::default)
            .add(report.outcome.kind());
    }
    Ok((AttemptOutcome::Stored, tables))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::FetchError;
    use crate::journal::read_lines;
    use crate::parser::registry::CVLAC;

    struct MockFetcher {
        pages: HashMap<u64, Vec<u8>>,
        calls: Arc<AtomicUsize>,
        /// Raised on the first fetch, as Ctrl-C would mid-sweep.
        interrupt: Option<CancelFlag>,
    }

    impl MockFetcher {
        fn new(calls: Arc<AtomicUsize>) -> Self {
            let fixture = |name: &str| std::fs::read(format!("tests/fixtures/{}.html", name)).unwrap();
            let mut pages = HashMap::new();
            pages.insert(3, fixture("cvlac_full"));
            pages.insert(4, fixture("cvlac_empty"));
            pages.insert(5, b"<html></html>".to_vec());
            Self { pages, calls, interrupt: None }
        }

        fn interrupting(calls: Arc<AtomicUsize>, cancel: CancelFlag) -> Self {
            Self { interrupt: Some(cancel), ..Self::new(calls) }
        }
    }

    impl Fetcher for MockFetcher {
        async fn fetch(&self, id: EntityId) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.interrupt {
                cancel.cancel();
            }
            self.pages.get(&id.value()).cloned().ok_or(FetchError::Status {
                status: 500,
                url: format!("mock://{}", id),
            })
        }
    }

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            db_path: dir.join("cvlac.sqlite"),
            data_dir: dir.join("data"),
            start: 1,
            total: 5,
            shard_size: 2,
            workers: 2,
            min_document_bytes: 100,
            report_flush_every: 1,
            ..Default::default()
        }
    }

    fn context(dir: &std::path::Path) -> Arc<RunContext> {
        let s = settings(dir);
        let conn = db::connect(&s.db_path, s.db_busy_timeout()).unwrap();
        db::init_schema(&conn).unwrap();
        Arc::new(RunContext::open(s).unwrap())
    }

    fn rows(dir: &std::path::Path, table: &str) -> i64 {
        let conn = rusqlite::Connection::open(dir.join("cvlac.sqlite")).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn shards_partition_the_range() {
        let s = shards(10, 25, 10);
        assert_eq!(s.len(), 3);
        assert_eq!((s[0].start, s[0].end), (10, 20));
        assert_eq!((s[2].start, s[2].end), (30, 35));
        assert_eq!(s.iter().map(Shard::len).sum::<u64>(), 25);
        assert!(shards(1, 0, 10).is_empty());
        assert_eq!(shards(0, 3, 1).len(), 3);

        for (start, total, size) in [(10, 25, 10), (0, 7, 3), (5, 4, 10), (1, 6, 1)] {
            let plan = shards(start, total, size);
            for pair in plan.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert_eq!(pair[0].index + 1, pair[1].index);
            }
            let ids: Vec<u64> = plan.iter().flat_map(Shard::ids).map(EntityId::value).collect();
            assert_eq!(ids, (start..start + total).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn crawl_stores_and_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let driver = CrawlDriver::new(Arc::clone(&ctx), MockFetcher::new(Arc::clone(&calls)), &CVLAC);

        let summary = driver.run().await.unwrap();
        assert_eq!(summary.shards, 3);
        assert_eq!(summary.attempted, 5);
        assert_eq!((summary.stored, summary.empty, summary.failed), (1, 2, 2));
        assert!(!summary.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        assert_eq!(rows(dir.path(), "identificacion"), 1);
        assert_eq!(rows(dir.path(), "articulos"), 2);
        assert_eq!(rows(dir.path(), "proyectos"), 2);

        let report = ctx.session.snapshot();
        assert_eq!(report.cvlacs_processed, 5);
        assert_eq!(report.success_count, 3);
        assert!(report.ended_at.is_some());
        let empty = report
            .processing_history
            .iter()
            .find(|h| h.cvlac_id == "0000000004")
            .unwrap();
        assert_eq!(empty.outcome, AttemptOutcome::Empty);
        assert!(empty.success);
        assert!(empty.tables.is_empty());

        // the malformed article volume and the broken project both surface as errors
        let errors = read_lines(&ctx.settings.error_log_path()).unwrap();
        assert!(errors.iter().any(|l| l.ends_with("extract:articulos")));
        assert!(errors.iter().any(|l| l.ends_with("extract:proyectos")));
        assert_eq!(errors.iter().filter(|l| l.ends_with("fetch")).count(), 2);
        assert_eq!(read_lines(&ctx.settings.processed_path()).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn rerun_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let ctx = context(dir.path());
            CrawlDriver::new(ctx, MockFetcher::new(Arc::clone(&calls)), &CVLAC)
                .run()
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let ctx = context(dir.path());
        let summary = CrawlDriver::new(ctx, MockFetcher::new(Arc::clone(&calls)), &CVLAC)
            .run()
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.attempted, 0);
        assert_eq!(rows(dir.path(), "articulos"), 2);
    }

    #[tokio::test]
    async fn cancelled_run_attempts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = CrawlDriver::new(Arc::clone(&ctx), MockFetcher::new(Arc::clone(&calls)), &CVLAC)
            .run()
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.checkpoint.len(), 0);
    }

    #[tokio::test]
    async fn interrupt_mid_sweep_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.workers = 1;
        s.shard_size = 1;
        let conn = db::connect(&s.db_path, s.db_busy_timeout()).unwrap();
        db::init_schema(&conn).unwrap();
        let ctx = Arc::new(RunContext::open(s).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = MockFetcher::interrupting(Arc::clone(&calls), ctx.cancel.clone());
        let driver = CrawlDriver::new(Arc::clone(&ctx), fetcher, &CVLAC);
        let summary = tokio::time::timeout(std::time::Duration::from_secs(10), driver.run())
            .await
            .expect("crawl did not stop after the interrupt")
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.checkpoint.len(), 1);
        assert!(ctx.checkpoint.contains(EntityId::new(1)));
        assert!(ctx.session.snapshot().ended_at.is_some());
    }

    #[tokio::test]
    async fn empty_document_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.start = 4;
        s.total = 1;
        let conn = db::connect(&s.db_path, s.db_busy_timeout()).unwrap();
        db::init_schema(&conn).unwrap();
        let ctx = Arc::new(RunContext::open(s).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let summary = CrawlDriver::new(Arc::clone(&ctx), MockFetcher::new(calls), &CVLAC)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.empty, 1);
        assert_eq!(rows(dir.path(), "articulos"), 0);
        assert!(ctx.session.snapshot().table_stats.is_empty());
        assert!(ctx.checkpoint.contains(EntityId::new(4)));
    }
}
