//! Shared crawl state: the depth-bucketed URL queue, per-URL status, worker
//! locks, extra seeds, and the crawl status machine.
//!
//! All coordination between workers goes through a [`CrawlStore`]. The store
//! delegates to a [`StoreBackend`]: the in-memory backend here serves
//! single-host crawls and tests, the redis backend (`redis_store`) serves
//! crawls sharded across replicas. Queue service is breadth-first by depth and
//! FIFO within a depth bucket.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// One queued URL with its position in the crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub url: String,
    pub seed_id: usize,
    pub depth: u32,
    pub extra_hops: u32,
    pub enqueued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
}

impl QueueEntry {
    pub fn new(url: impl Into<String>, seed_id: usize, depth: u32, extra_hops: u32) -> Self {
        Self {
            url: url.into(),
            seed_id,
            depth,
            extra_hops,
            enqueued_at: epoch_secs(),
            page_id: None,
        }
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    DupeUrl,
    LimitHit,
}

/// Crawl status as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    #[default]
    Running,
    Done,
    Failing,
    Failed,
    Canceled,
    Interrupted,
    Debug,
}

impl CrawlStatus {
    /// The crawl should keep claiming work.
    pub fn is_running(self) -> bool {
        matches!(self, CrawlStatus::Running | CrawlStatus::Failing)
    }

    /// A terminal or stopping status.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            CrawlStatus::Done | CrawlStatus::Failed | CrawlStatus::Canceled | CrawlStatus::Interrupted
        )
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrawlStatus::Running => "running",
            CrawlStatus::Done => "done",
            CrawlStatus::Failing => "failing",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Canceled => "canceled",
            CrawlStatus::Interrupted => "interrupted",
            CrawlStatus::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// Identity of a page worker: hostname plus worker index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub hostname: String,
    pub index: u32,
}

impl WorkerId {
    pub fn new(hostname: impl Into<String>, index: u32) -> Self {
        Self {
            hostname: hostname.into(),
            index,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.hostname, self.index)
    }
}

/// Operator command posted on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "regex")]
pub enum ControlCommand {
    #[serde(rename = "addExclusion")]
    AddExclusion(String),
    #[serde(rename = "removeExclusion")]
    RemoveExclusion(String),
    #[serde(rename = "cancel")]
    Cancel,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "stop-gracefully")]
    StopGracefully,
}

/// Persisted record of a seed created from a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraSeed {
    pub seed_id: usize,
    pub orig_seed_id: usize,
    pub url: String,
}

/// Full store snapshot, as written into checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Queue entries grouped by depth; includes entries that were in-progress
    /// when the snapshot was taken.
    pub queued: BTreeMap<u32, Vec<QueueEntry>>,
    pub seen: Vec<String>,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    pub excluded: Vec<String>,
    pub extra_seeds: Vec<ExtraSeed>,
    pub sitemap_done: bool,
    pub status: CrawlStatus,
    pub archive_size: u64,
}

impl StateSnapshot {
    pub fn queued_count(&self) -> usize {
        self.queued.values().map(Vec::len).sum()
    }
}

/// Operations every store backend provides. All operations are atomic with
/// respect to concurrent workers.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn add_to_queue(
        &self,
        entry: QueueEntry,
        page_limit: Option<usize>,
    ) -> Result<AddResult, StoreError>;

    /// Claim the next URL: lowest depth first, FIFO within a depth. An expired
    /// lock is reclaimed in preference to new work; the claimant becomes the
    /// new owner.
    async fn next_from_queue(
        &self,
        worker: &WorkerId,
        lock_ttl: Duration,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// Returns false when the caller no longer owns the URL (stale worker).
    async fn mark_finished(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError>;
    async fn mark_failed(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError>;
    async fn mark_excluded(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError>;

    /// Return all locks held by workers on `hostname` to the queue. Called on
    /// startup to clean up after an abrupt prior exit.
    async fn clear_own_pending_locks(&self, hostname: &str) -> Result<usize, StoreError>;

    /// Record a redirect-created seed; dedups on `(orig_seed_id, url)` and
    /// returns the (deterministic) new seed id either way.
    async fn add_extra_seed(&self, orig_seed_id: usize, url: &str) -> Result<usize, StoreError>;
    async fn extra_seeds(&self) -> Result<Vec<ExtraSeed>, StoreError>;

    async fn mark_sitemap_done(&self) -> Result<(), StoreError>;
    async fn is_sitemap_done(&self) -> Result<bool, StoreError>;

    async fn set_status(&self, status: CrawlStatus) -> Result<(), StoreError>;
    async fn get_status(&self) -> Result<CrawlStatus, StoreError>;

    async fn queue_size(&self) -> Result<usize, StoreError>;
    async fn num_pending(&self) -> Result<usize, StoreError>;
    async fn num_done(&self) -> Result<usize, StoreError>;
    async fn num_failed(&self) -> Result<usize, StoreError>;
    async fn num_seen(&self) -> Result<usize, StoreError>;
    async fn pending_list(&self) -> Result<Vec<QueueEntry>, StoreError>;

    async fn set_archive_size(&self, bytes: u64) -> Result<(), StoreError>;
    async fn archive_size(&self) -> Result<u64, StoreError>;

    async fn snapshot(&self) -> Result<StateSnapshot, StoreError>;
    async fn load(&self, snapshot: StateSnapshot, resume: bool) -> Result<(), StoreError>;

    async fn next_control_message(&self) -> Result<Option<ControlCommand>, StoreError>;
    async fn push_control_message(&self, cmd: ControlCommand) -> Result<(), StoreError>;
}

struct PendingLock {
    entry: QueueEntry,
    owner: String,
    owner_host: String,
    deadline_ms: u64,
}

#[derive(Default)]
struct StoreInner {
    queue: BTreeMap<u32, VecDeque<QueueEntry>>,
    seen: HashSet<String>,
    pending: HashMap<String, PendingLock>,
    done: HashSet<String>,
    failed: HashSet<String>,
    excluded: HashSet<String>,
    extra_seeds: Vec<ExtraSeed>,
    sitemap_done: bool,
    status: CrawlStatus,
    archive_size: u64,
    control: VecDeque<ControlCommand>,
}

/// In-process backend guarded by a single mutex.
pub struct MemoryBackend {
    inner: Mutex<StoreInner>,
    original_seed_count: usize,
}

impl MemoryBackend {
    pub fn new(original_seed_count: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            original_seed_count,
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn add_to_queue(
        &self,
        entry: QueueEntry,
        page_limit: Option<usize>,
    ) -> Result<AddResult, StoreError> {
        let mut inner = self.inner.lock();
        if inner.seen.contains(&entry.url) {
            return Ok(AddResult::DupeUrl);
        }
        if let Some(limit) = page_limit {
            // seen = queued + in-progress + done + failed + excluded
            if inner.seen.len() >= limit {
                return Ok(AddResult::LimitHit);
            }
        }
        inner.seen.insert(entry.url.clone());
        inner.queue.entry(entry.depth).or_default().push_back(entry);
        Ok(AddResult::Added)
    }

    async fn next_from_queue(
        &self,
        worker: &WorkerId,
        lock_ttl: Duration,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_ms();
        let deadline = now + lock_ttl.as_millis() as u64;

        // Reclaim the longest-expired lock first.
        let expired = inner
            .pending
            .iter()
            .filter(|(_, lock)| lock.deadline_ms <= now)
            .min_by_key(|(_, lock)| lock.deadline_ms)
            .map(|(url, _)| url.clone());
        if let Some(url) = expired {
            if let Some(lock) = inner.pending.get_mut(&url) {
                lock.owner = worker.to_string();
                lock.owner_host = worker.hostname.clone();
                lock.deadline_ms = deadline;
                return Ok(Some(lock.entry.clone()));
            }
        }

        let lowest = match inner.queue.keys().next().copied() {
            Some(depth) => depth,
            None => return Ok(None),
        };
        let entry = {
            let bucket = inner
                .queue
                .get_mut(&lowest)
                .expect("lowest depth bucket exists");
            let entry = bucket.pop_front().expect("non-empty bucket");
            if bucket.is_empty() {
                inner.queue.remove(&lowest);
            }
            entry
        };
        inner.pending.insert(
            entry.url.clone(),
            PendingLock {
                entry: entry.clone(),
                owner: worker.to_string(),
                owner_host: worker.hostname.clone(),
                deadline_ms: deadline,
            },
        );
        Ok(Some(entry))
    }

    async fn mark_finished(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.finish_into(worker, url, Terminal::Done)
    }

    async fn mark_failed(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.finish_into(worker, url, Terminal::Failed)
    }

    async fn mark_excluded(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.finish_into(worker, url, Terminal::Excluded)
    }

    async fn clear_own_pending_locks(&self, hostname: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let own: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, lock)| lock.owner_host == hostname)
            .map(|(url, _)| url.clone())
            .collect();
        let count = own.len();
        for url in own {
            if let Some(lock) = inner.pending.remove(&url) {
                inner
                    .queue
                    .entry(lock.entry.depth)
                    .or_default()
                    .push_front(lock.entry);
            }
        }
        Ok(count)
    }

    async fn add_extra_seed(&self, orig_seed_id: usize, url: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .extra_seeds
            .iter()
            .find(|s| s.orig_seed_id == orig_seed_id && s.url == url)
        {
            return Ok(existing.seed_id);
        }
        let seed_id = self.original_seed_count + inner.extra_seeds.len();
        inner.extra_seeds.push(ExtraSeed {
            seed_id,
            orig_seed_id,
            url: url.to_string(),
        });
        Ok(seed_id)
    }

    async fn extra_seeds(&self) -> Result<Vec<ExtraSeed>, StoreError> {
        Ok(self.inner.lock().extra_seeds.clone())
    }

    async fn mark_sitemap_done(&self) -> Result<(), StoreError> {
        self.inner.lock().sitemap_done = true;
        Ok(())
    }

    async fn is_sitemap_done(&self) -> Result<bool, StoreError> {
        Ok(self.inner.lock().sitemap_done)
    }

    async fn set_status(&self, status: CrawlStatus) -> Result<(), StoreError> {
        self.inner.lock().status = status;
        Ok(())
    }

    async fn get_status(&self) -> Result<CrawlStatus, StoreError> {
        Ok(self.inner.lock().status)
    }

    async fn queue_size(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().queue.values().map(VecDeque::len).sum())
    }

    async fn num_pending(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().pending.len())
    }

    async fn num_done(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().done.len())
    }

    async fn num_failed(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().failed.len())
    }

    async fn num_seen(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().seen.len())
    }

    async fn pending_list(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .pending
            .values()
            .map(|lock| lock.entry.clone())
            .collect())
    }

    async fn set_archive_size(&self, bytes: u64) -> Result<(), StoreError> {
        self.inner.lock().archive_size = bytes;
        Ok(())
    }

    async fn archive_size(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().archive_size)
    }

    async fn snapshot(&self) -> Result<StateSnapshot, StoreError> {
        let inner = self.inner.lock();
        let mut queued: BTreeMap<u32, Vec<QueueEntry>> = BTreeMap::new();
        // In-progress entries return to the front of their depth bucket so a
        // restart re-serves them first.
        for lock in inner.pending.values() {
            queued
                .entry(lock.entry.depth)
                .or_default()
                .push(lock.entry.clone());
        }
        for (depth, bucket) in &inner.queue {
            queued
                .entry(*depth)
                .or_default()
                .extend(bucket.iter().cloned());
        }
        Ok(StateSnapshot {
            queued,
            seen: inner.seen.iter().cloned().collect(),
            done: inner.done.iter().cloned().collect(),
            failed: inner.failed.iter().cloned().collect(),
            excluded: inner.excluded.iter().cloned().collect(),
            extra_seeds: inner.extra_seeds.clone(),
            sitemap_done: inner.sitemap_done,
            status: inner.status,
            archive_size: inner.archive_size,
        })
    }

    async fn load(&self, snapshot: StateSnapshot, resume: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.done = snapshot.done.iter().cloned().collect();
        inner.failed = snapshot.failed.iter().cloned().collect();
        inner.excluded = snapshot.excluded.iter().cloned().collect();
        inner.seen = snapshot.seen.iter().cloned().collect();
        // Terminal URLs are always part of the seen set.
        for url in snapshot
            .done
            .iter()
            .chain(&snapshot.failed)
            .chain(&snapshot.excluded)
        {
            inner.seen.insert(url.clone());
        }
        inner.extra_seeds = snapshot.extra_seeds;
        inner.sitemap_done = snapshot.sitemap_done;
        inner.archive_size = snapshot.archive_size;
        inner.pending.clear();
        inner.queue.clear();
        if resume {
            for (depth, entries) in snapshot.queued {
                inner.queue.insert(depth, entries.into());
            }
        } else {
            // Fresh run over old state: drop queued URLs from the seen set so
            // the new crawl may reach them again.
            let queued_urls: Vec<String> = snapshot
                .queued
                .values()
                .flatten()
                .map(|e| e.url.clone())
                .collect();
            for url in queued_urls {
                if !inner.done.contains(&url)
                    && !inner.failed.contains(&url)
                    && !inner.excluded.contains(&url)
                {
                    inner.seen.remove(&url);
                }
            }
        }
        inner.status = CrawlStatus::Running;
        Ok(())
    }

    async fn next_control_message(&self) -> Result<Option<ControlCommand>, StoreError> {
        Ok(self.inner.lock().control.pop_front())
    }

    async fn push_control_message(&self, cmd: ControlCommand) -> Result<(), StoreError> {
        self.inner.lock().control.push_back(cmd);
        Ok(())
    }
}

enum Terminal {
    Done,
    Failed,
    Excluded,
}

impl MemoryBackend {
    fn finish_into(&self, worker: &WorkerId, url: &str, terminal: Terminal) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let owner_matches = inner
            .pending
            .get(url)
            .map(|lock| lock.owner == worker.to_string())
            .unwrap_or(false);
        if !owner_matches {
            // Stale worker (lock reclaimed) or unknown URL.
            return Ok(false);
        }
        inner.pending.remove(url);
        match terminal {
            Terminal::Done => inner.done.insert(url.to_string()),
            Terminal::Failed => inner.failed.insert(url.to_string()),
            Terminal::Excluded => inner.excluded.insert(url.to_string()),
        };
        Ok(true)
    }
}

/// Shared handle used by every component; wraps the backend with the crawl id,
/// the lock TTL, and the sticky page-limit flag.
pub struct CrawlStore {
    backend: Arc<dyn StoreBackend>,
    crawl_id: String,
    lock_ttl: Duration,
    page_limit: Option<usize>,
    limit_hit: AtomicBool,
}

impl CrawlStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        crawl_id: impl Into<String>,
        lock_ttl: Duration,
        page_limit: Option<usize>,
    ) -> Self {
        Self {
            backend,
            crawl_id: crawl_id.into(),
            lock_ttl,
            page_limit,
            limit_hit: AtomicBool::new(false),
        }
    }

    /// In-memory store for a single-host crawl.
    pub fn in_memory(
        crawl_id: impl Into<String>,
        original_seed_count: usize,
        lock_ttl: Duration,
        page_limit: Option<usize>,
    ) -> Self {
        Self::new(
            Arc::new(MemoryBackend::new(original_seed_count)),
            crawl_id,
            lock_ttl,
            page_limit,
        )
    }

    pub fn crawl_id(&self) -> &str {
        &self.crawl_id
    }

    pub fn page_limit(&self) -> Option<usize> {
        self.page_limit
    }

    /// Sticky: true once any enqueue has hit the page limit.
    pub fn limit_hit(&self) -> bool {
        self.limit_hit.load(Ordering::Relaxed)
    }

    pub async fn add_to_queue(&self, entry: QueueEntry) -> Result<AddResult, StoreError> {
        if self.limit_hit() {
            return Ok(AddResult::LimitHit);
        }
        let result = self.backend.add_to_queue(entry, self.page_limit).await?;
        if result == AddResult::LimitHit {
            self.limit_hit.store(true, Ordering::Relaxed);
        }
        Ok(result)
    }

    pub async fn next_from_queue(
        &self,
        worker: &WorkerId,
    ) -> Result<Option<QueueEntry>, StoreError> {
        self.backend.next_from_queue(worker, self.lock_ttl).await
    }

    pub async fn mark_finished(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.backend.mark_finished(worker, url).await
    }

    pub async fn mark_failed(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.backend.mark_failed(worker, url).await
    }

    pub async fn mark_excluded(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.backend.mark_excluded(worker, url).await
    }

    pub async fn clear_own_pending_locks(&self, hostname: &str) -> Result<usize, StoreError> {
        self.backend.clear_own_pending_locks(hostname).await
    }

    pub async fn add_extra_seed(
        &self,
        orig_seed_id: usize,
        url: &str,
    ) -> Result<usize, StoreError> {
        self.backend.add_extra_seed(orig_seed_id, url).await
    }

    pub async fn extra_seeds(&self) -> Result<Vec<ExtraSeed>, StoreError> {
        self.backend.extra_seeds().await
    }

    pub async fn mark_sitemap_done(&self) -> Result<(), StoreError> {
        self.backend.mark_sitemap_done().await
    }

    pub async fn is_sitemap_done(&self) -> Result<bool, StoreError> {
        self.backend.is_sitemap_done().await
    }

    pub async fn set_status(&self, status: CrawlStatus) -> Result<(), StoreError> {
        self.backend.set_status(status).await
    }

    pub async fn get_status(&self) -> Result<CrawlStatus, StoreError> {
        self.backend.get_status().await
    }

    pub async fn is_crawl_running(&self) -> Result<bool, StoreError> {
        Ok(self.get_status().await?.is_running())
    }

    pub async fn is_crawl_canceled(&self) -> Result<bool, StoreError> {
        Ok(self.get_status().await? == CrawlStatus::Canceled)
    }

    pub async fn is_crawl_stopped(&self) -> Result<bool, StoreError> {
        Ok(self.get_status().await?.is_stopped())
    }

    pub async fn queue_size(&self) -> Result<usize, StoreError> {
        self.backend.queue_size().await
    }

    pub async fn num_pending(&self) -> Result<usize, StoreError> {
        self.backend.num_pending().await
    }

    pub async fn num_done(&self) -> Result<usize, StoreError> {
        self.backend.num_done().await
    }

    pub async fn num_failed(&self) -> Result<usize, StoreError> {
        self.backend.num_failed().await
    }

    pub async fn num_seen(&self) -> Result<usize, StoreError> {
        self.backend.num_seen().await
    }

    pub async fn pending_list(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.backend.pending_list().await
    }

    pub async fn set_archive_size(&self, bytes: u64) -> Result<(), StoreError> {
        self.backend.set_archive_size(bytes).await
    }

    pub async fn archive_size(&self) -> Result<u64, StoreError> {
        self.backend.archive_size().await
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, StoreError> {
        self.backend.snapshot().await
    }

    pub async fn load(&self, snapshot: StateSnapshot, resume: bool) -> Result<(), StoreError> {
        self.backend.load(snapshot, resume).await
    }

    pub async fn next_control_message(&self) -> Result<Option<ControlCommand>, StoreError> {
        self.backend.next_control_message().await
    }

    pub async fn push_control_message(&self, cmd: ControlCommand) -> Result<(), StoreError> {
        self.backend.push_control_message(cmd).await
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(page_limit: Option<usize>) -> CrawlStore {
        CrawlStore::in_memory("test-crawl", 1, Duration::from_secs(60), page_limit)
    }

    fn worker(index: u32) -> WorkerId {
        WorkerId::new("host-0", index)
    }

    #[tokio::test]
    async fn test_dedup_on_enqueue() {
        let store = store(None);
        let entry = QueueEntry::new("https://example.com/a", 0, 0, 0);
        assert_eq!(store.add_to_queue(entry.clone()).await.unwrap(), AddResult::Added);
        assert_eq!(
            store.add_to_queue(entry).await.unwrap(),
            AddResult::DupeUrl
        );
        assert_eq!(store.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bfs_order_fifo_within_depth() {
        let store = store(None);
        store
            .add_to_queue(QueueEntry::new("https://s/d1-a", 0, 1, 0))
            .await
            .unwrap();
        store
            .add_to_queue(QueueEntry::new("https://s/d0", 0, 0, 0))
            .await
            .unwrap();
        store
            .add_to_queue(QueueEntry::new("https://s/d1-b", 0, 1, 0))
            .await
            .unwrap();

        let w = worker(0);
        let urls: Vec<String> = {
            let mut urls = Vec::new();
            while let Some(entry) = store.next_from_queue(&w).await.unwrap() {
                urls.push(entry.url.clone());
                store.mark_finished(&w, &entry.url).await.unwrap();
            }
            urls
        };
        assert_eq!(urls, vec!["https://s/d0", "https://s/d1-a", "https://s/d1-b"]);
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let store = store(None);
        store
            .add_to_queue(QueueEntry::new("https://s/only", 0, 0, 0))
            .await
            .unwrap();
        let first = store.next_from_queue(&worker(0)).await.unwrap();
        assert!(first.is_some());
        // Second worker sees nothing while the lock is held.
        let second = store.next_from_queue(&worker(1)).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.num_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lock_reclaimed_and_stale_finish_ignored() {
        let store = CrawlStore::in_memory("t", 1, Duration::from_millis(0), None);
        store
            .add_to_queue(QueueEntry::new("https://s/slow", 0, 0, 0))
            .await
            .unwrap();

        let stale = worker(0);
        let entry = store.next_from_queue(&stale).await.unwrap().unwrap();
        // TTL of zero: the lock is immediately reclaimable.
        let claimer = worker(1);
        let reclaimed = store.next_from_queue(&claimer).await.unwrap().unwrap();
        assert_eq!(reclaimed.url, entry.url);

        // The stale worker's finish is ignored; the new owner's counts.
        assert!(!store.mark_finished(&stale, &entry.url).await.unwrap());
        assert_eq!(store.num_done().await.unwrap(), 0);
        assert!(store.mark_finished(&claimer, &entry.url).await.unwrap());
        assert_eq!(store.num_done().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_page_limit_sticky() {
        let store = store(Some(2));
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/1", 0, 0, 0))
                .await
                .unwrap(),
            AddResult::Added
        );
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/2", 0, 1, 0))
                .await
                .unwrap(),
            AddResult::Added
        );
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/3", 0, 1, 0))
                .await
                .unwrap(),
            AddResult::LimitHit
        );
        assert!(store.limit_hit());
        // Sticky: even a would-be dupe reports the limit now.
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/1", 0, 0, 0))
                .await
                .unwrap(),
            AddResult::LimitHit
        );
    }

    #[tokio::test]
    async fn test_clear_own_pending_locks() {
        let store = store(None);
        store
            .add_to_queue(QueueEntry::new("https://s/a", 0, 0, 0))
            .await
            .unwrap();
        store
            .add_to_queue(QueueEntry::new("https://s/b", 0, 0, 0))
            .await
            .unwrap();
        let mine = WorkerId::new("host-a", 0);
        let theirs = WorkerId::new("host-b", 0);
        store.next_from_queue(&mine).await.unwrap().unwrap();
        store.next_from_queue(&theirs).await.unwrap().unwrap();

        let cleared = store.clear_own_pending_locks("host-a").await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(store.num_pending().await.unwrap(), 1);
        assert_eq!(store.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_extra_seed_numbering_deterministic() {
        let backend = Arc::new(MemoryBackend::new(3));
        let store = CrawlStore::new(backend, "t", Duration::from_secs(60), None);
        let a = store
            .add_extra_seed(0, "https://landed.example/one")
            .await
            .unwrap();
        let b = store
            .add_extra_seed(1, "https://landed.example/two")
            .await
            .unwrap();
        assert_eq!(a, 3);
        assert_eq!(b, 4);
        // Replaying the same redirect returns the same id.
        let again = store
            .add_extra_seed(0, "https://landed.example/one")
            .await
            .unwrap();
        assert_eq!(again, a);
        assert_eq!(store.extra_seeds().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sitemap_done_idempotent() {
        let store = store(None);
        assert!(!store.is_sitemap_done().await.unwrap());
        store.mark_sitemap_done().await.unwrap();
        store.mark_sitemap_done().await.unwrap();
        assert!(store.is_sitemap_done().await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = store(None);
        for i in 0..5u32 {
            store
                .add_to_queue(QueueEntry::new(format!("https://s/{i}"), 0, i % 2, 0))
                .await
                .unwrap();
        }
        let w = worker(0);
        let claimed = store.next_from_queue(&w).await.unwrap().unwrap();
        store.mark_finished(&w, &claimed.url).await.unwrap();
        let claimed = store.next_from_queue(&w).await.unwrap().unwrap();
        store.mark_failed(&w, &claimed.url).await.unwrap();
        // One left in-progress to prove it lands back in the queue.
        store.next_from_queue(&w).await.unwrap().unwrap();
        store.add_extra_seed(0, "https://t/landed").await.unwrap();
        store.mark_sitemap_done().await.unwrap();
        store.set_archive_size(1234).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.queued_count(), 3); // 2 queued + 1 in-progress
        assert_eq!(snapshot.done.len(), 1);
        assert_eq!(snapshot.failed.len(), 1);

        let restored = self::store(None);
        restored.load(snapshot.clone(), true).await.unwrap();
        let restored_snapshot = restored.snapshot().await.unwrap();
        assert_eq!(restored_snapshot.queued_count(), snapshot.queued_count());
        assert_eq!(restored_snapshot.done, snapshot.done);
        assert_eq!(restored_snapshot.failed, snapshot.failed);
        assert_eq!(restored_snapshot.extra_seeds, snapshot.extra_seeds);
        assert_eq!(restored_snapshot.sitemap_done, snapshot.sitemap_done);
        assert_eq!(restored_snapshot.archive_size, snapshot.archive_size);
        assert_eq!(restored.num_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_without_resume_keeps_terminal_sets_only() {
        let store = store(None);
        store
            .add_to_queue(QueueEntry::new("https://s/done", 0, 0, 0))
            .await
            .unwrap();
        store
            .add_to_queue(QueueEntry::new("https://s/queued", 0, 1, 0))
            .await
            .unwrap();
        let w = worker(0);
        let entry = store.next_from_queue(&w).await.unwrap().unwrap();
        store.mark_finished(&w, &entry.url).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let fresh = self::store(None);
        fresh.load(snapshot, false).await.unwrap();
        assert_eq!(fresh.queue_size().await.unwrap(), 0);
        assert_eq!(fresh.num_done().await.unwrap(), 1);
        // The done URL stays deduped; the formerly-queued one may be re-added.
        assert_eq!(
            fresh
                .add_to_queue(QueueEntry::new("https://s/done", 0, 0, 0))
                .await
                .unwrap(),
            AddResult::DupeUrl
        );
        assert_eq!(
            fresh
                .add_to_queue(QueueEntry::new("https://s/queued", 0, 1, 0))
                .await
                .unwrap(),
            AddResult::Added
        );
    }

    #[tokio::test]
    async fn test_control_channel_fifo() {
        let store = store(None);
        store
            .push_control_message(ControlCommand::AddExclusion("/private".into()))
            .await
            .unwrap();
        store
            .push_control_message(ControlCommand::StopGracefully)
            .await
            .unwrap();
        assert_eq!(
            store.next_control_message().await.unwrap(),
            Some(ControlCommand::AddExclusion("/private".into()))
        );
        assert_eq!(
            store.next_control_message().await.unwrap(),
            Some(ControlCommand::StopGracefully)
        );
        assert_eq!(store.next_control_message().await.unwrap(), None);
    }

    #[test]
    fn test_control_command_wire_format() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type":"addExclusion","regex":"/admin"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::AddExclusion("/admin".into()));
        let cmd: ControlCommand = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Cancel);
        let cmd: ControlCommand = serde_json::from_str(r#"{"type":"stop-gracefully"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::StopGracefully);
    }

    #[test]
    fn test_status_predicates() {
        assert!(CrawlStatus::Running.is_running());
        assert!(CrawlStatus::Failing.is_running());
        assert!(!CrawlStatus::Interrupted.is_running());
        assert!(CrawlStatus::Canceled.is_stopped());
        assert!(CrawlStatus::Done.is_stopped());
        assert!(!CrawlStatus::Debug.is_stopped());
    }
}
