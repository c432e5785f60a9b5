//! Spawns the page workers and waits them out.

use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::browser::Browser;
use crate::config::CrawlConfig;
use crate::context::CrawlContext;
use crate::driver::PageDriver;
use crate::extractor::LinkExtractor;
use crate::scope::ScopeEngine;
use crate::store::{CrawlStore, WorkerId};
use crate::worker::{PageEvent, PageWorker, WorkerError};

/// This host's name, for worker identity and lock ownership.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Worker-id offset for this replica: with `CRAWL_ID` set, a trailing `-<n>`
/// hostname ordinal (stateful replica sets) shifts our ids by `n * workers`.
pub fn worker_id_offset(workers: usize, host: &str) -> u32 {
    if std::env::var("CRAWL_ID").map(|v| v.is_empty()).unwrap_or(true) {
        return 0;
    }
    let ordinal = Regex::new(r"-(\d+)$")
        .ok()
        .and_then(|re| re.captures(host).and_then(|c| c[1].parse::<u32>().ok()));
    match ordinal {
        Some(n) => n * workers as u32,
        None => 0,
    }
}

pub struct WorkerPool {
    config: Arc<CrawlConfig>,
    store: Arc<CrawlStore>,
    scope: Arc<ScopeEngine>,
    driver: Arc<PageDriver>,
    extractor: Arc<LinkExtractor>,
    ctx: Arc<CrawlContext>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<CrawlConfig>,
        store: Arc<CrawlStore>,
        scope: Arc<ScopeEngine>,
        driver: Arc<PageDriver>,
        extractor: Arc<LinkExtractor>,
        ctx: Arc<CrawlContext>,
    ) -> Self {
        Self {
            config,
            store,
            scope,
            driver,
            extractor,
            ctx,
        }
    }

    /// Run all workers to completion, then close the shared browser. Returns
    /// the first fatal error any worker raised.
    pub async fn run(
        &self,
        browser: Arc<dyn Browser>,
        events: mpsc::Sender<PageEvent>,
    ) -> Result<(), String> {
        let host = hostname();
        let offset = worker_id_offset(self.config.workers, &host);
        info!(
            target: "worker",
            "starting {} workers with ids [{}, {})",
            self.config.workers,
            offset,
            offset + self.config.workers as u32
        );

        let mut set = JoinSet::new();
        for i in 0..self.config.workers {
            let worker = PageWorker::new(
                WorkerId::new(host.clone(), offset + i as u32),
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                Arc::clone(&self.scope),
                Arc::clone(&self.driver),
                Arc::clone(&self.extractor),
                Arc::clone(&browser),
                Arc::clone(&self.ctx),
                events.clone(),
            );
            set.spawn(worker.run());
        }
        drop(events);

        let mut fatal: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(WorkerError::Fatal(reason))) => {
                    error!(target: "worker", fatal = true, "worker fatal: {}", reason);
                    if fatal.is_none() {
                        fatal = Some(reason);
                    }
                    // One fatal worker takes the crawl down.
                    self.ctx.cancel.cancel();
                }
                Err(join_error) => {
                    warn!(target: "worker", "worker task join error: {}", join_error);
                    if join_error.is_panic() && fatal.is_none() {
                        fatal = Some(format!("worker panicked: {}", join_error));
                        self.ctx.cancel.cancel();
                    }
                }
            }
        }

        if let Err(e) = browser.close().await {
            warn!(target: "worker", "browser close failed: {}", e);
        }
        match fatal {
            None => Ok(()),
            Some(reason) => Err(reason),
        }
    }
}
