//! Top-level crawl orchestration: state restore, seeding, sitemap fan-out,
//! limit enforcement, checkpointing, and signal-driven shutdown.
//!
//! The coordinator is the only component that knows about all the others;
//! everything below it communicates through the store and the crawl context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use url::Url;

use crate::archive::Archive;
use crate::browser::Browser;
use crate::checkpoint::{CheckpointError, Checkpointer};
use crate::config::{ConfigError, CrawlConfig, Limits, SaveStateMode};
use crate::context::CrawlContext;
use crate::driver::{DriverError, PageDriver};
use crate::extractor::LinkExtractor;
use crate::pool::{hostname, WorkerPool};
use crate::redis_store::RedisBackend;
use crate::scope::{ScopeEngine, ScopeError};
use crate::sitemap::SitemapIngester;
use crate::store::{
    CrawlStatus, CrawlStore, MemoryBackend, QueueEntry, StoreBackend, StoreError,
};
use crate::worker::PageEvent;

/// Wall-clock budget for a sitemap's initial batch before the crawl proceeds.
const SITEMAP_INITIAL_FETCH_SECS: u64 = 30;
/// Poll interval while parked on `debug` status.
const DEBUG_POLL_SECS: u64 = 3;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signal handler setup failed: {0}")]
    Signal(std::io::Error),
}

/// How the crawl ended; maps onto the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlExit {
    Done,
    Canceled,
    Interrupted {
        browser_crashed: bool,
        during_serialize: bool,
    },
    Fatal(String),
}

impl CrawlExit {
    pub fn code(&self, restarts_on_error: bool) -> i32 {
        match self {
            CrawlExit::Done | CrawlExit::Canceled => 0,
            CrawlExit::Interrupted {
                during_serialize: true,
                ..
            } => 13,
            CrawlExit::Interrupted {
                browser_crashed: true,
                ..
            } => 10,
            CrawlExit::Interrupted { .. } => 11,
            CrawlExit::Fatal(_) => {
                if restarts_on_error {
                    0
                } else {
                    17
                }
            }
        }
    }
}

pub struct CrawlCoordinator {
    config: Arc<CrawlConfig>,
    scope: Arc<ScopeEngine>,
    store: Arc<CrawlStore>,
    archive: Arc<Archive>,
    driver: Arc<PageDriver>,
    extractor: Arc<LinkExtractor>,
    ingester: Arc<SitemapIngester>,
    checkpointer: Checkpointer,
    ctx: Arc<CrawlContext>,
}

impl CrawlCoordinator {
    pub async fn new(mut config: CrawlConfig) -> Result<Self, CrawlError> {
        config.validate()?;
        let seed_configs = config.resolve_seeds()?;
        let scope = Arc::new(ScopeEngine::from_configs(&seed_configs)?);

        let crawl_id = config.crawl_id();
        let collection_dir = config.collection_dir();
        let archive = Arc::new(Archive::new(&collection_dir, config.dry_run));
        let checkpointer =
            Checkpointer::new(&collection_dir, &crawl_id, config.save_state_history);

        let backend: Arc<dyn StoreBackend> = match config.store_url() {
            Some(url) => Arc::new(
                RedisBackend::connect(
                    &url,
                    &crawl_id,
                    scope.original_count(),
                    config.redis_store_clean,
                )
                .await?,
            ),
            None => Arc::new(MemoryBackend::new(scope.original_count())),
        };
        let store = Arc::new(CrawlStore::new(
            backend,
            crawl_id,
            config.max_page_time(),
            config.page_limit_opt(),
        ));

        let config = Arc::new(config);
        let driver = Arc::new(PageDriver::new(Arc::clone(&config), Arc::clone(&archive))?);
        let extractor = Arc::new(LinkExtractor::new(Arc::clone(&scope), Arc::clone(&store)));
        let ingester = Arc::new(SitemapIngester::new(
            &config,
            Arc::clone(&scope),
            Arc::clone(&store),
        )?);

        Ok(Self {
            config,
            scope,
            store,
            archive,
            driver,
            extractor,
            ingester,
            checkpointer,
            ctx: CrawlContext::new(),
        })
    }

    pub fn context(&self) -> Arc<CrawlContext> {
        Arc::clone(&self.ctx)
    }

    pub fn store(&self) -> Arc<CrawlStore> {
        Arc::clone(&self.store)
    }

    /// Restore the latest checkpoint, if one exists, and rebuild the extra
    /// seed table from the store.
    async fn restore_state(&self) -> Result<bool, CrawlError> {
        let Some(checkpoint) = self.checkpointer.latest()? else {
            return Ok(false);
        };
        let queued = checkpoint.state.queued_count();
        self.store.load(checkpoint.state, true).await?;
        for extra in self.store.extra_seeds().await? {
            match Url::parse(&extra.url) {
                Ok(url) => {
                    if let Err(e) =
                        self.scope
                            .register_extra_seed(extra.seed_id, extra.orig_seed_id, url)
                    {
                        warn!(target: "state", "could not restore extra seed: {}", e);
                    }
                }
                Err(e) => warn!(target: "state", "bad extra seed url {}: {}", extra.url, e),
            }
        }
        info!(
            target: "state",
            "resumed from checkpoint: {} queued, {} done",
            queued,
            self.store.num_done().await?
        );
        Ok(true)
    }

    pub async fn run(&self, browser: Arc<dyn Browser>) -> Result<CrawlExit, CrawlError> {
        let start = Instant::now();
        self.restore_state().await?;

        // Operator inspection: park while the stored status says debug.
        while self.store.get_status().await? == CrawlStatus::Debug {
            info!(target: "crawlStatus", "status is debug, waiting");
            tokio::time::sleep(Duration::from_secs(DEBUG_POLL_SECS)).await;
            if self.ctx.cancel.is_cancelled() {
                return Ok(CrawlExit::Canceled);
            }
        }

        if self.store.get_status().await? == CrawlStatus::Done {
            info!(target: "crawlStatus", "crawl already done");
            if self.config.wait_on_done {
                self.ctx.cancel.cancelled().await;
            }
            return Ok(CrawlExit::Done);
        }

        // Clean up after an abrupt prior exit on this host.
        let reclaimed = self.store.clear_own_pending_locks(&hostname()).await?;
        if reclaimed > 0 {
            info!(target: "state", "returned {} stale locks to the queue", reclaimed);
        }
        self.store.set_status(CrawlStatus::Running).await?;
        self.spawn_signal_handler()?;

        // Seed the queue and fan out sitemap ingestion.
        for seed in self.scope.seeds() {
            if !seed.original {
                continue;
            }
            let entry = QueueEntry::new(seed.url.as_str(), seed.id, 0, 0);
            let _ = self.store.add_to_queue(entry).await?;
            if seed.sitemap.is_some() && !self.store.is_sitemap_done().await? {
                Arc::clone(&self.ingester)
                    .start(
                        Arc::clone(&seed),
                        Duration::from_secs(SITEMAP_INITIAL_FETCH_SECS),
                    )
                    .await;
            }
        }

        // Workers report every finished page; the event loop checkpoints and
        // enforces limits between pages.
        let (events_tx, mut events_rx) = mpsc::channel::<PageEvent>(self.config.workers * 2);
        let pool = WorkerPool::new(
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.scope),
            Arc::clone(&self.driver),
            Arc::clone(&self.extractor),
            Arc::clone(&self.ctx),
        );
        let pool_browser = Arc::clone(&browser);
        let pool_task =
            tokio::spawn(async move { pool.run(pool_browser, events_tx).await });

        let mut last_checkpoint = Instant::now();
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.on_page_event(&event, start, &mut last_checkpoint).await;
                        }
                        None => break,
                    }
                }
                _ = self.ctx.cancel.cancelled() => break,
            }
        }

        let pool_result = match pool_task.await {
            Ok(result) => result,
            Err(join_error) => Err(format!("worker pool task failed: {}", join_error)),
        };
        if let Err(reason) = &pool_result {
            self.ctx.set_fatal(reason.clone());
        }

        self.finish(start).await
    }

    /// Decide the final status, flush the last checkpoint, and map to an exit.
    async fn finish(&self, start: Instant) -> Result<CrawlExit, CrawlError> {
        let elapsed = start.elapsed().as_secs();
        if let Some(reason) = self.ctx.fatal() {
            error!(target: "crawlStatus", fatal = true, "crawl failed: {}", reason);
            self.store.set_status(CrawlStatus::Failed).await?;
            self.flush_final_checkpoint(true).await;
            return Ok(CrawlExit::Fatal(reason));
        }

        match self.store.get_status().await? {
            CrawlStatus::Canceled => {
                info!(target: "crawlStatus", elapsed, "crawl canceled");
                self.flush_final_checkpoint(true).await;
                Ok(CrawlExit::Canceled)
            }
            CrawlStatus::Interrupted => {
                info!(target: "crawlStatus", elapsed, "crawl interrupted");
                self.flush_final_checkpoint(true).await;
                Ok(CrawlExit::Interrupted {
                    browser_crashed: self.ctx.browser_crashed(),
                    during_serialize: self.ctx.interrupted_during_serialize(),
                })
            }
            _ => {
                self.store.set_status(CrawlStatus::Done).await?;
                info!(
                    target: "crawlStatus",
                    elapsed,
                    done = self.store.num_done().await.unwrap_or(0) as u64,
                    failed = self.store.num_failed().await.unwrap_or(0) as u64,
                    "crawl done"
                );
                self.flush_final_checkpoint(false).await;
                if self.config.wait_on_done {
                    self.ctx.cancel.cancelled().await;
                }
                Ok(CrawlExit::Done)
            }
        }
    }

    async fn on_page_event(
        &self,
        event: &PageEvent,
        start: Instant,
        last_checkpoint: &mut Instant,
    ) {
        info!(
            target: "crawlStatus",
            url = event.url.as_str(),
            success = event.success,
            queued = self.store.queue_size().await.unwrap_or(0) as u64,
            pending = self.store.num_pending().await.unwrap_or(0) as u64,
            done = self.store.num_done().await.unwrap_or(0) as u64,
            failed = self.store.num_failed().await.unwrap_or(0) as u64,
            "page complete"
        );

        if self.config.save_state == SaveStateMode::Always
            && last_checkpoint.elapsed() >= Duration::from_secs(self.config.save_state_interval)
        {
            if self.write_checkpoint().await {
                *last_checkpoint = Instant::now();
            }
        }
        self.check_limits(start).await;
    }

    /// Size/time/disk/failed-count limits, evaluated after every page.
    async fn check_limits(&self, start: Instant) {
        if self.config.size_limit > 0 {
            let size = self.archive.measure_size();
            let _ = self.store.set_archive_size(size).await;
            if size > self.config.size_limit {
                self.stop_gracefully("size limit reached");
            }
        }
        if self.config.time_limit > 0
            && start.elapsed() >= Duration::from_secs(self.config.time_limit)
        {
            self.stop_gracefully("time limit reached");
        }
        if self.config.disk_utilization > 0 {
            match self.archive.disk_utilization().await {
                Ok(pct) if pct >= self.config.disk_utilization => {
                    self.stop_gracefully("disk utilization threshold reached");
                }
                Ok(_) => {}
                Err(e) => warn!(target: "crawlStatus", "disk check failed: {}", e),
            }
        }
        if self.config.fail_on_failed_limit > 0 {
            let failed = self.store.num_failed().await.unwrap_or(0);
            if failed >= self.config.fail_on_failed_limit {
                let _ = self.store.set_status(CrawlStatus::Failing).await;
                self.ctx
                    .set_fatal(format!("{} pages failed, over failOnFailedLimit", failed));
                self.ctx.cancel.cancel();
            }
        }
    }

    fn stop_gracefully(&self, reason: &str) {
        if !self.ctx.graceful_requested() {
            info!(target: "crawlStatus", "stopping crawl: {}", reason);
            self.ctx.request_graceful_stop();
        }
    }

    /// Write a checkpoint; the serializing bracket lets the signal handler
    /// tell an interrupt-during-serialize apart.
    async fn write_checkpoint(&self) -> bool {
        self.ctx.set_serializing(true);
        let result = match self.store.snapshot().await {
            Ok(snapshot) => self
                .checkpointer
                .write(&self.config, &snapshot)
                .map(|_| true)
                .unwrap_or_else(|e| {
                    warn!(target: "state", "checkpoint write failed: {}", e);
                    false
                }),
            Err(e) => {
                warn!(target: "state", "snapshot failed: {}", e);
                false
            }
        };
        self.ctx.set_serializing(false);
        result
    }

    async fn flush_final_checkpoint(&self, interrupted: bool) {
        let should_write = match self.config.save_state {
            SaveStateMode::Never => false,
            SaveStateMode::Partial => interrupted,
            SaveStateMode::Always => true,
        };
        if should_write {
            self.write_checkpoint().await;
        }
    }

    /// First INT/TERM stops gracefully; a second within the hard-stop window,
    /// or any signal after SIGABRT, cancels outright.
    fn spawn_signal_handler(&self) -> Result<(), CrawlError> {
        let mut sigint = signal(SignalKind::interrupt()).map_err(CrawlError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(CrawlError::Signal)?;
        // SIGABRT arms force-terminate.
        let mut sigabrt = signal(SignalKind::from_raw(6)).map_err(CrawlError::Signal)?;

        let ctx = Arc::clone(&self.ctx);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut last_signal: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                    _ = sigabrt.recv() => {
                        warn!(target: "crawlStatus", "SIGABRT received, arming force terminate");
                        ctx.arm_force();
                        continue;
                    }
                }
                let now = Instant::now();
                let hard = ctx.force_armed()
                    || last_signal
                        .map(|t| {
                            now.duration_since(t)
                                <= Duration::from_millis(Limits::HARD_STOP_WINDOW_MS)
                        })
                        .unwrap_or(false);
                if hard {
                    warn!(target: "crawlStatus", "hard stop requested");
                    let _ = store.set_status(CrawlStatus::Canceled).await;
                    ctx.cancel.cancel();
                } else {
                    info!(target: "crawlStatus", "graceful stop requested, interrupt again to force");
                    if ctx.is_serializing() {
                        ctx.mark_interrupted_during_serialize();
                    }
                    ctx.request_graceful_stop();
                    let _ = store.set_status(CrawlStatus::Interrupted).await;
                    last_signal = Some(now);
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CrawlExit::Done.code(false), 0);
        assert_eq!(CrawlExit::Canceled.code(false), 0);
        assert_eq!(
            CrawlExit::Interrupted {
                browser_crashed: false,
                during_serialize: false
            }
            .code(false),
            11
        );
        assert_eq!(
            CrawlExit::Interrupted {
                browser_crashed: true,
                during_serialize: false
            }
            .code(false),
            10
        );
        assert_eq!(
            CrawlExit::Interrupted {
                browser_crashed: true,
                during_serialize: true
            }
            .code(false),
            13
        );
        assert_eq!(CrawlExit::Fatal("x".into()).code(false), 17);
        assert_eq!(CrawlExit::Fatal("x".into()).code(true), 0);
    }
}
