//! Sitemap ingestion: streams URLs out of a seed's sitemap (and nested
//! sitemap indexes) into the crawl queue.
//!
//! The initial [`SitemapIngester::start`] call resolves once the sitemap ends
//! or after the first batch of URLs, whichever comes first, so the
//! coordinator can proceed while a large sitemap keeps draining in the
//! background. URLs flow through a bounded channel sized to the worker count;
//! the consumer side applies scope checks (with the out-of-scope allowance
//! disabled) and enqueues.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use sitemap::structs::LastMod;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::RetryPolicy;
use crate::config::{CrawlConfig, Limits};
use crate::scope::{ScopeEngine, Seed, SitemapSpec};
use crate::store::{AddResult, CrawlStore, QueueEntry};

/// Paths probed when a seed asks for sitemap detection.
const DETECT_PATHS: &[&str] = &["/sitemap.xml", "/sitemap_index.xml", "/sitemap/sitemap.xml"];

pub struct SitemapIngester {
    http: reqwest::Client,
    scope: Arc<ScopeEngine>,
    store: Arc<CrawlStore>,
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    channel_capacity: usize,
    retry: RetryPolicy,
}

impl SitemapIngester {
    pub fn new(
        config: &CrawlConfig,
        scope: Arc<ScopeEngine>,
        store: Arc<CrawlStore>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            scope,
            store,
            from_date: config.sitemap_from_date,
            to_date: config.sitemap_to_date,
            channel_capacity: config.workers.max(1),
            retry: RetryPolicy::new(
                Limits::SITEMAP_FETCH_ATTEMPTS,
                Duration::from_millis(500),
                Duration::from_secs(10),
            ),
        })
    }

    /// Ingest a seed's sitemap. Returns once the first
    /// `Limits::SITEMAP_INITIAL_URLS` URLs were emitted, the sitemap ended,
    /// or `initial_timeout` elapsed; ingestion continues in the background
    /// either way. Never fails the crawl.
    pub async fn start(self: Arc<Self>, seed: Arc<Seed>, initial_timeout: Duration) {
        let sitemap_url = match &seed.sitemap {
            None => return,
            Some(SitemapSpec::Url(url)) => url.clone(),
            Some(SitemapSpec::Detect) => match self.detect(&seed).await {
                Some(url) => url,
                None => {
                    info!(target: "sitemap", "no sitemap detected for {}", seed.url);
                    return;
                }
            },
        };

        let (url_tx, url_rx) = mpsc::channel::<String>(self.channel_capacity);
        let (resolve_tx, resolve_rx) = oneshot::channel::<()>();

        let producer = Arc::clone(&self);
        let producer_seed = Arc::clone(&seed);
        tokio::spawn(async move {
            producer
                .produce(sitemap_url, producer_seed, url_tx, resolve_tx)
                .await;
        });

        let consumer = Arc::clone(&self);
        tokio::spawn(async move {
            consumer.consume(seed, url_rx).await;
        });

        // Early resolution: the caller proceeds once the first batch arrived.
        let _ = tokio::time::timeout(initial_timeout, resolve_rx).await;
    }

    /// Probe robots.txt `Sitemap:` lines, then conventional paths.
    async fn detect(&self, seed: &Seed) -> Option<Url> {
        let origin = seed.url.origin().ascii_serialization();
        let robots_url = format!("{}/robots.txt", origin);
        if let Some(body) = self.fetch_text(&robots_url).await {
            for line in body.lines() {
                let line = line.trim();
                if line.to_ascii_lowercase().starts_with("sitemap:") {
                    if let Some(raw) = line.split_whitespace().nth(1) {
                        if let Ok(url) = Url::parse(raw) {
                            info!(target: "sitemap", "sitemap declared in robots.txt: {}", url);
                            return Some(url);
                        }
                    }
                }
            }
        }
        for path in DETECT_PATHS {
            let candidate = format!("{}{}", origin, path);
            if self.fetch_text(&candidate).await.is_some() {
                info!(target: "sitemap", "sitemap found at {}", candidate);
                return Url::parse(&candidate).ok();
            }
        }
        None
    }

    /// Fetch and parse sitemaps, pushing URL entries into the channel.
    /// Nested sitemap indexes are appended to the fetch list.
    async fn produce(
        &self,
        root: Url,
        seed: Arc<Seed>,
        url_tx: mpsc::Sender<String>,
        resolve_tx: oneshot::Sender<()>,
    ) {
        let mut pending = vec![root.to_string()];
        let mut emitted = 0usize;
        let mut resolve_tx = Some(resolve_tx);

        while let Some(sitemap_url) = pending.pop() {
            let Some(body) = self.fetch_with_retry(&sitemap_url).await else {
                warn!(target: "sitemap", "skipping unfetchable sitemap {}", sitemap_url);
                continue;
            };
            let reader = SiteMapReader::new(Cursor::new(body));
            for entity in reader {
                match entity {
                    SiteMapEntity::Url(entry) => {
                        let Some(loc) = entry.loc.get_url() else { continue };
                        let lastmod = match entry.lastmod {
                            LastMod::DateTime(dt) => Some(dt.date_naive()),
                            _ => None,
                        };
                        if !self.within_date_window(lastmod) {
                            continue;
                        }
                        if url_tx.send(loc.to_string()).await.is_err() {
                            return;
                        }
                        emitted += 1;
                        if emitted >= Limits::SITEMAP_INITIAL_URLS {
                            if let Some(tx) = resolve_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    SiteMapEntity::SiteMap(entry) => {
                        if let Some(loc) = entry.loc.get_url() {
                            pending.push(loc.to_string());
                        }
                    }
                    SiteMapEntity::Err(e) => {
                        warn!(
                            target: "sitemap",
                            "parse error in {}: {}", sitemap_url, e
                        );
                    }
                }
            }
        }
        debug!(target: "sitemap", "sitemap for {} ended after {} urls", seed.url, emitted);
        if let Some(tx) = resolve_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Scope-check and enqueue until the channel drains, then flag the
    /// sitemap as done (exactly once, idempotent on the store side).
    async fn consume(&self, seed: Arc<Seed>, mut url_rx: mpsc::Receiver<String>) {
        let mut counted = 0usize;
        let mut enqueued = 0usize;
        while let Some(candidate) = url_rx.recv().await {
            counted += 1;
            // Per-seed limit: keep counting, stop enqueueing.
            if let Some(limit) = seed.page_limit {
                if enqueued >= limit {
                    continue;
                }
            }
            let Some(hit) = self.scope.is_included(seed.id, &candidate, 0, 0, true) else {
                continue;
            };
            let entry = QueueEntry::new(hit.url.as_str(), seed.id, 0, 0);
            match self.store.add_to_queue(entry).await {
                Ok(AddResult::Added) => enqueued += 1,
                Ok(AddResult::DupeUrl) => {}
                Ok(AddResult::LimitHit) => {
                    debug!(target: "sitemap", "page limit hit during sitemap ingest");
                }
                Err(e) => warn!(target: "sitemap", "enqueue failed: {}", e),
            }
        }
        if let Err(e) = self.store.mark_sitemap_done().await {
            warn!(target: "sitemap", "could not flag sitemap done: {}", e);
        }
        info!(
            target: "sitemap",
            "sitemap ingest finished for {}: {} urls seen, {} queued", seed.url, counted, enqueued
        );
    }

    fn within_date_window(&self, lastmod: Option<NaiveDate>) -> bool {
        let Some(date) = lastmod else {
            // Entries without lastmod are only filtered out when a lower
            // bound was requested.
            return self.from_date.is_none();
        };
        if let Some(from) = self.from_date {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.to_date {
            if date > to {
                return false;
            }
        }
        true
    }

    async fn fetch_with_retry(&self, url: &str) -> Option<Vec<u8>> {
        for attempt in 0..self.retry.attempts {
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => return Some(bytes.to_vec()),
                        Err(e) => {
                            warn!(target: "sitemap", "body read failed for {}: {}", url, e);
                        }
                    }
                }
                Ok(response) => {
                    // Permanent HTTP failure: do not retry.
                    debug!(
                        target: "sitemap",
                        "sitemap fetch {} returned {}", url, response.status()
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        target: "sitemap",
                        "sitemap fetch {} failed (attempt {}): {}", url, attempt + 1, e
                    );
                }
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
        None
    }

    async fn fetch_text(&self, url: &str) -> Option<String> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}
