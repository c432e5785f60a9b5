//! Page workers: each owns one browser window at a time, claims URLs from the
//! store, and runs them through the driver + extractor pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{Browser, BrowserError, FrameInfo, Window};
use crate::config::{CrawlConfig, Limits};
use crate::context::CrawlContext;
use crate::driver::{is_html_mime, NavOutcome, PageDriver};
use crate::extractor::{ExtractStats, LinkExtractor, LinkSelector};
use crate::page::{LoadState, PageState};
use crate::scope::{normalize_candidate, ScopeEngine, Seed};
use crate::store::{CrawlStore, QueueEntry, WorkerId};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
enum PageError {
    #[error("load failed: {0}")]
    LoadFailed(String),
    #[error("chrome error page")]
    ChromeError,
    #[error("HTTP {0}")]
    HttpError(u16),
    #[error("page deadline exceeded")]
    Deadline,
    #[error("crawl canceled mid-page")]
    Canceled,
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Sent to the coordinator after every page so it can checkpoint and check
/// limits.
#[derive(Debug, Clone)]
pub struct PageEvent {
    pub url: String,
    pub seed_id: usize,
    pub depth: u32,
    pub success: bool,
}

/// One prepared window plus the per-page plumbing shared with its request
/// policy and host callbacks.
struct WindowSession {
    window: Box<dyn Window>,
    target: Arc<Mutex<Url>>,
    resources: Arc<Mutex<Vec<String>>>,
    link_rx: mpsc::UnboundedReceiver<String>,
    behavior_rx: mpsc::UnboundedReceiver<String>,
    origin: url::Origin,
    pages_served: u32,
}

pub struct PageWorker {
    id: WorkerId,
    config: Arc<CrawlConfig>,
    store: Arc<CrawlStore>,
    scope: Arc<ScopeEngine>,
    driver: Arc<PageDriver>,
    extractor: Arc<LinkExtractor>,
    browser: Arc<dyn Browser>,
    ctx: Arc<CrawlContext>,
    events: mpsc::Sender<PageEvent>,
}

impl PageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        config: Arc<CrawlConfig>,
        store: Arc<CrawlStore>,
        scope: Arc<ScopeEngine>,
        driver: Arc<PageDriver>,
        extractor: Arc<LinkExtractor>,
        browser: Arc<dyn Browser>,
        ctx: Arc<CrawlContext>,
        events: mpsc::Sender<PageEvent>,
    ) -> Self {
        Self {
            id,
            config,
            store,
            scope,
            driver,
            extractor,
            browser,
            ctx,
            events,
        }
    }

    pub async fn run(self) -> Result<(), WorkerError> {
        info!(target: "worker", "worker {} starting", self.id);
        let mut session: Option<WindowSession> = None;
        let mut window_failures: u32 = 0;

        let exit = loop {
            if self.ctx.cancel.is_cancelled() || self.ctx.graceful_requested() {
                break Ok(());
            }
            if let Err(e) = self
                .ctx
                .drain_control_messages(&self.store, &self.scope)
                .await
            {
                warn!(target: "worker", "control drain failed: {}", e);
            }
            if self.ctx.is_paused() {
                tokio::time::sleep(Duration::from_millis(Limits::WORKER_IDLE_POLL_MS)).await;
                continue;
            }
            if !self.store.is_crawl_running().await.unwrap_or(false) {
                break Ok(());
            }

            let entry = match self.store.next_from_queue(&self.id).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "worker", "claim failed: {}", e);
                    if self.config.exit_on_redis_error {
                        break Err(WorkerError::Fatal(format!("store unreachable: {}", e)));
                    }
                    tokio::time::sleep(Duration::from_millis(Limits::WORKER_IDLE_POLL_MS)).await;
                    continue;
                }
            };
            let Some(entry) = entry else {
                // Queue empty for now: wait while other workers may still
                // discover links; exit once nothing is pending anywhere.
                if self.store.num_pending().await.unwrap_or(0) > 0 {
                    tokio::time::sleep(Duration::from_millis(Limits::WORKER_IDLE_POLL_MS)).await;
                    continue;
                }
                if self.store.queue_size().await.unwrap_or(0) == 0 {
                    break Ok(());
                }
                continue;
            };

            // Exclusions may have changed since this URL was enqueued.
            let hit = self.scope.is_included(
                entry.seed_id,
                &entry.url,
                entry.depth,
                entry.extra_hops,
                false,
            );
            let Some(hit) = hit else {
                debug!(target: "worker", "claimed URL now out of scope: {}", entry.url);
                let _ = self.store.mark_excluded(&self.id, &entry.url).await;
                continue;
            };
            let page_url = hit.url;

            let Some(seed) = self.scope.seed(entry.seed_id) else {
                warn!(target: "worker", "unknown seed {} for {}", entry.seed_id, entry.url);
                let _ = self.store.mark_failed(&self.id, &entry.url).await;
                continue;
            };

            // Window acquisition: reuse for same-origin pages up to the cap.
            let origin = page_url.origin();
            let reusable = session
                .as_ref()
                .map(|s| {
                    !s.window.crashed()
                        && s.origin == origin
                        && s.pages_served < Limits::MAX_WINDOW_REUSE
                })
                .unwrap_or(false);
            if !reusable {
                if let Some(old) = session.take() {
                    let _ = old.window.close().await;
                }
                match self.open_session(&seed, &page_url).await {
                    Ok(new_session) => {
                        session = Some(new_session);
                        window_failures = 0;
                    }
                    Err(e) => {
                        warn!(target: "worker", "window open failed: {}", e);
                        window_failures += 1;
                        let _ = self.store.mark_failed(&self.id, &entry.url).await;
                        if window_failures > Limits::MAX_WINDOW_REUSE {
                            self.ctx.set_browser_crashed();
                            break Err(WorkerError::Fatal(format!(
                                "cannot obtain a browser window after {} attempts",
                                window_failures
                            )));
                        }
                        continue;
                    }
                }
            }
            let active = session.as_mut().expect("session present after acquisition");

            let deadline = self.config.max_page_time();
            let result = tokio::select! {
                result = tokio::time::timeout(
                    deadline,
                    Self::process_page(
                        &self.config,
                        &self.store,
                        &self.scope,
                        &self.driver,
                        &self.extractor,
                        active,
                        &seed,
                        entry.clone(),
                        page_url.clone(),
                    ),
                ) => result.unwrap_or(Err(PageError::Deadline)),
                _ = self.ctx.cancel.cancelled() => Err(PageError::Canceled),
            };

            if matches!(result, Err(PageError::Canceled)) {
                // Hard stop: leave the lock for restart reclamation.
                break Ok(());
            }

            let crashed = session
                .as_ref()
                .map(|s| s.window.crashed())
                .unwrap_or(false);

            match result {
                Ok(page) if page.is_finished_successfully() && !crashed => {
                    if let Some(s) = session.as_mut() {
                        s.pages_served += 1;
                    }
                    window_failures = 0;
                    info!(
                        target: "pageStatus",
                        url = page.entry.url.as_str(),
                        depth = page.entry.depth,
                        status = page.status,
                        "page finished"
                    );
                    let _ = self.store.mark_finished(&self.id, &entry.url).await;
                    let _ = self
                        .events
                        .send(PageEvent {
                            url: entry.url.clone(),
                            seed_id: page.entry.seed_id,
                            depth: entry.depth,
                            success: true,
                        })
                        .await;
                }
                result => {
                    let reason = match &result {
                        Ok(_) => "window crashed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!(
                        target: "pageStatus",
                        url = entry.url.as_str(),
                        depth = entry.depth,
                        "page failed: {}", reason
                    );
                    let _ = self.store.mark_failed(&self.id, &entry.url).await;
                    let _ = self
                        .events
                        .send(PageEvent {
                            url: entry.url.clone(),
                            seed_id: entry.seed_id,
                            depth: entry.depth,
                            success: false,
                        })
                        .await;

                    // A crashed window is unusable; one that blew the page
                    // deadline may be wedged mid-navigation. Replace both.
                    if crashed || matches!(result, Err(PageError::Deadline)) {
                        if let Some(old) = session.take() {
                            let _ = old.window.close().await;
                        }
                    }
                    if crashed {
                        window_failures += 1;
                        if window_failures > Limits::MAX_WINDOW_REUSE {
                            self.ctx.set_browser_crashed();
                            break Err(WorkerError::Fatal(format!(
                                "{} consecutive window crashes",
                                window_failures
                            )));
                        }
                    }

                    if entry.depth == 0 && self.config.fail_on_failed_seed {
                        break Err(WorkerError::Fatal(format!(
                            "seed URL failed: {} ({})",
                            entry.url, reason
                        )));
                    }
                }
            }
        };

        if let Some(old) = session.take() {
            let _ = old.window.close().await;
        }
        info!(target: "worker", "worker {} exiting", self.id);
        exit
    }

    /// Open and prepare a fresh window for a seed.
    async fn open_session(
        &self,
        seed: &Seed,
        page_url: &Url,
    ) -> Result<WindowSession, BrowserError> {
        let window = self.browser.new_window().await?;
        let target = Arc::new(Mutex::new(page_url.clone()));
        let resources = Arc::new(Mutex::new(Vec::new()));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (behavior_tx, behavior_rx) = mpsc::unbounded_channel();
        self.driver
            .prepare(
                window.as_ref(),
                seed,
                Arc::clone(&target),
                Arc::clone(&resources),
                link_tx,
                behavior_tx,
            )
            .await?;
        Ok(WindowSession {
            window,
            target,
            resources,
            link_rx,
            behavior_rx,
            origin: page_url.origin(),
            pages_served: 0,
        })
    }

    /// One page, end to end: navigate, waits, extraction, behaviors.
    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        config: &CrawlConfig,
        store: &CrawlStore,
        scope: &ScopeEngine,
        driver: &PageDriver,
        extractor: &LinkExtractor,
        session: &mut WindowSession,
        seed: &Seed,
        entry: QueueEntry,
        page_url: Url,
    ) -> Result<PageState, PageError> {
        let mut page = PageState::new(entry);
        *session.target.lock() = page_url.clone();
        session.resources.lock().clear();
        while session.link_rx.try_recv().is_ok() {}

        let window = session.window.as_ref();
        match driver.navigate(window, &page_url).await {
            NavOutcome::Ok(response) => {
                page.advance(LoadState::ContentLoaded);
                page.advance(LoadState::FullPageLoaded);
                page.status = response.status;
                page.is_html_page = response
                    .mime
                    .as_deref()
                    .map(is_html_mime)
                    .unwrap_or(true);
                page.mime = response.mime.clone();

                // A seed that landed on a different URL spawns an extra seed
                // so its children are scoped against the landed origin.
                if page.entry.depth == 0 {
                    if let Some(landed) = normalize_candidate(&response.url, seed.allow_hash) {
                        if landed.as_str() != page_url.as_str() {
                            match store
                                .add_extra_seed(page.entry.seed_id, landed.as_str())
                                .await
                            {
                                Ok(new_seed_id) => {
                                    if let Err(e) = scope.register_extra_seed(
                                        new_seed_id,
                                        page.entry.seed_id,
                                        landed.clone(),
                                    ) {
                                        warn!(target: "state", "extra seed rejected: {}", e);
                                    } else {
                                        info!(
                                            target: "state",
                                            "seed redirect {} -> {}, extra seed {}",
                                            page_url, landed, new_seed_id
                                        );
                                        page.entry.seed_id = new_seed_id;
                                        *session.target.lock() = landed;
                                    }
                                }
                                Err(e) => {
                                    warn!(target: "state", "extra seed store failed: {}", e)
                                }
                            }
                        }
                    }
                }
            }
            NavOutcome::DownloadDetected { mime } => {
                // The download is the capture; nothing further to do in-page.
                page.advance(LoadState::FullPageLoaded);
                page.mime = Some(mime);
                page.is_html_page = false;
                page.add_detail("download", true);
                return Ok(page);
            }
            NavOutcome::SlowPage(response) => {
                page.advance(LoadState::ContentLoaded);
                page.advance(LoadState::FullPageLoaded);
                page.slow_page = true;
                page.is_html_page = true;
                if let Some(response) = response {
                    page.status = response.status;
                    page.mime = response.mime;
                }
                warn!(target: "pageStatus", url = page_url.as_str(), "page loading slowly");
            }
            NavOutcome::LoadFailed(reason) => return Err(PageError::LoadFailed(reason)),
            NavOutcome::ChromeError => return Err(PageError::ChromeError),
            NavOutcome::HttpError(status) => return Err(PageError::HttpError(status)),
        }

        page.filtered_frames = driver.filter_frames(window).await?;
        let main_frame = page
            .filtered_frames
            .iter()
            .find(|f| f.is_main)
            .cloned()
            .unwrap_or_else(|| FrameInfo {
                id: "main".to_string(),
                url: page_url.to_string(),
                is_main: true,
                owner_tag: None,
            });

        driver.check_anti_bot(window, &main_frame).await;
        driver.await_net_idle(window).await;
        if !page.slow_page {
            driver.await_custom_page_load(window, &main_frame).await;
        }

        if page.is_html_page
            && !scope.is_at_max_depth(page.entry.seed_id, page.entry.depth, page.entry.extra_hops)
        {
            let selectors =
                LinkSelector::parse_all(&config.link_selectors_for(&seed.select_links));
            let mut stats = extractor
                .extract(window, &page.entry, &page.filtered_frames, &selectors)
                .await;
            drain_link_callbacks(extractor, &mut session.link_rx, &page.entry, &mut stats).await;
            page.add_detail("linksQueued", stats.queued as u64);
            page.add_detail("linksExtracted", stats.extracted as u64);
        }
        page.advance(LoadState::ExtractionDone);

        if config.enable_behaviors && page.is_html_page && !page.slow_page {
            let behaviors_ok = driver.run_behaviors(window, &main_frame).await;
            drain_behavior_log(&mut session.behavior_rx);
            let mut stats = ExtractStats::default();
            drain_link_callbacks(extractor, &mut session.link_rx, &page.entry, &mut stats).await;
            if behaviors_ok {
                page.advance(LoadState::BehaviorsDone);
            }
        }

        if config.page_extra_delay > 0 {
            tokio::time::sleep(Duration::from_secs(config.page_extra_delay)).await;
        }

        page.resources = session.resources.lock().clone();
        page.title = fetch_title(window, &main_frame).await;
        Ok(page)
    }
}

/// Funnel `__addLink` callback URLs through the normal candidate path.
async fn drain_link_callbacks(
    extractor: &LinkExtractor,
    link_rx: &mut mpsc::UnboundedReceiver<String>,
    parent: &QueueEntry,
    stats: &mut ExtractStats,
) {
    while let Ok(raw) = link_rx.try_recv() {
        extractor.queue_candidate(parent, &raw, stats).await;
    }
}

fn drain_behavior_log(behavior_rx: &mut mpsc::UnboundedReceiver<String>) {
    while let Ok(line) = behavior_rx.try_recv() {
        info!(target: "behavior", "{}", line);
    }
}

async fn fetch_title(window: &dyn Window, main_frame: &FrameInfo) -> Option<String> {
    let value = tokio::time::timeout(
        Duration::from_secs(Limits::PAGE_OP_TIMEOUT_SECS),
        window.evaluate(&main_frame.id, "document.title"),
    )
    .await
    .ok()?
    .ok()?;
    value
        .as_str()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}
