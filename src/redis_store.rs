//! Redis-backed store for crawls sharded across stateful replicas.
//!
//! Layout, all keys prefixed with the crawl id:
//!
//! ```text
//! <id>:q:<depth>   list    queue entries (JSON), FIFO within the depth
//! <id>:qd          zset    depths with a non-empty queue list
//! <id>:seen        set     every URL ever enqueued
//! <id>:pe          hash    url -> queue entry (JSON) for in-progress URLs
//! <id>:po          hash    url -> owning worker ("host#index")
//! <id>:pd          zset    url scored by lock deadline (epoch ms)
//! <id>:done/:failed/:excluded   sets of terminal URLs
//! <id>:extra       list    extra-seed records (JSON), append-only
//! <id>:smd         string  sitemap-done flag
//! <id>:status      string  crawl status
//! <id>:size        string  archive size in bytes
//! <id>:msg         list    operator control channel
//! ```
//!
//! Claim, finish and reclaim run as Lua scripts so each is one atomic step.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::warn;

use crate::store::{
    AddResult, ControlCommand, CrawlStatus, ExtraSeed, QueueEntry, StateSnapshot, StoreBackend,
    StoreError, WorkerId,
};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

const ADD_TO_QUEUE: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return 'dupe'
end
local limit = tonumber(ARGV[2])
if limit > 0 and redis.call('SCARD', KEYS[1]) >= limit then
  return 'limit'
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[4])
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[3])
return 'added'
"#;

const NEXT_FROM_QUEUE: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[1], 'LIMIT', 0, 1)
if expired[1] then
  local url = expired[1]
  redis.call('HSET', KEYS[3], url, ARGV[3])
  redis.call('ZADD', KEYS[4], tonumber(ARGV[2]), url)
  return redis.call('HGET', KEYS[2], url)
end
local depths = redis.call('ZRANGE', KEYS[1], 0, 0)
if not depths[1] then
  return false
end
local qkey = ARGV[4] .. depths[1]
local data = redis.call('LPOP', qkey)
if not data then
  redis.call('ZREM', KEYS[1], depths[1])
  return false
end
if redis.call('LLEN', qkey) == 0 then
  redis.call('ZREM', KEYS[1], depths[1])
end
local url = cjson.decode(data)['url']
redis.call('HSET', KEYS[2], url, data)
redis.call('HSET', KEYS[3], url, ARGV[3])
redis.call('ZADD', KEYS[4], tonumber(ARGV[2]), url)
return data
"#;

const MARK_TERMINAL: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[1])
return 1
"#;

const CLEAR_OWN_LOCKS: &str = r#"
local owners = redis.call('HGETALL', KEYS[1])
local count = 0
for i = 1, #owners, 2 do
  local url = owners[i]
  local owner = owners[i + 1]
  if string.sub(owner, 1, string.len(ARGV[1])) == ARGV[1] then
    local data = redis.call('HGET', KEYS[2], url)
    if data then
      local depth = cjson.decode(data)['depth']
      redis.call('LPUSH', ARGV[2] .. tostring(depth), data)
      redis.call('ZADD', KEYS[3], depth, depth)
    end
    redis.call('HDEL', KEYS[1], url)
    redis.call('HDEL', KEYS[2], url)
    redis.call('ZREM', KEYS[4], url)
    count = count + 1
  end
end
return count
"#;

const ADD_EXTRA_SEED: &str = r#"
local len = redis.call('LLEN', KEYS[1])
for i = 0, len - 1 do
  local item = cjson.decode(redis.call('LINDEX', KEYS[1], i))
  if item['origSeedId'] == tonumber(ARGV[1]) and item['url'] == ARGV[2] then
    return item['seedId']
  end
end
local id = tonumber(ARGV[3]) + len
redis.call('RPUSH', KEYS[1], cjson.encode({
  seedId = id,
  origSeedId = tonumber(ARGV[1]),
  url = ARGV[2],
}))
return id
"#;

/// Shared store backend over a redis instance.
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    original_seed_count: usize,
    add_script: Script,
    next_script: Script,
    terminal_script: Script,
    clear_script: Script,
    extra_seed_script: Script,
}

impl RedisBackend {
    /// Connect, retrying indefinitely; the store is required for everything
    /// else, so startup blocks until it is reachable.
    pub async fn connect(
        url: &str,
        crawl_id: &str,
        original_seed_count: usize,
        clean: bool,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!(target: "state", "store connect failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };
        let backend = Self {
            conn,
            prefix: crawl_id.to_string(),
            original_seed_count,
            add_script: Script::new(ADD_TO_QUEUE),
            next_script: Script::new(NEXT_FROM_QUEUE),
            terminal_script: Script::new(MARK_TERMINAL),
            clear_script: Script::new(CLEAR_OWN_LOCKS),
            extra_seed_script: Script::new(ADD_EXTRA_SEED),
        };
        if clean {
            backend.clear_all().await?;
        }
        Ok(backend)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn queue_key_prefix(&self) -> String {
        self.key("q:")
    }

    async fn queue_depths(&self) -> Result<Vec<u32>, StoreError> {
        let mut conn = self.conn.clone();
        let depths: Vec<u32> = conn.zrange(self.key("qd"), 0, -1).await?;
        Ok(depths)
    }

    /// Drop every key of this crawl (fresh start with `redisStoreClean`).
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        for depth in self.queue_depths().await? {
            let _: () = conn.del(format!("{}{}", self.queue_key_prefix(), depth)).await?;
        }
        for suffix in [
            "qd", "seen", "pe", "po", "pd", "done", "failed", "excluded", "extra", "smd",
            "status", "size", "msg",
        ] {
            let _: () = conn.del(self.key(suffix)).await?;
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        worker: &WorkerId,
        url: &str,
        terminal_key: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .terminal_script
            .key(self.key("po"))
            .key(self.key("pe"))
            .key(self.key("pd"))
            .key(self.key(terminal_key))
            .arg(url)
            .arg(worker.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn set_members(&self, suffix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.key(suffix)).await?;
        Ok(members)
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn add_to_queue(
        &self,
        entry: QueueEntry,
        page_limit: Option<usize>,
    ) -> Result<AddResult, StoreError> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&entry)?;
        let result: String = self
            .add_script
            .key(self.key("seen"))
            .key(self.key("qd"))
            .key(format!("{}{}", self.queue_key_prefix(), entry.depth))
            .arg(&entry.url)
            .arg(page_limit.unwrap_or(0))
            .arg(entry.depth)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        Ok(match result.as_str() {
            "dupe" => AddResult::DupeUrl,
            "limit" => AddResult::LimitHit,
            _ => AddResult::Added,
        })
    }

    async fn next_from_queue(
        &self,
        worker: &WorkerId,
        lock_ttl: Duration,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let now = crate::store::epoch_ms();
        let deadline = now + lock_ttl.as_millis() as u64;
        let data: Option<String> = self
            .next_script
            .key(self.key("qd"))
            .key(self.key("pe"))
            .key(self.key("po"))
            .key(self.key("pd"))
            .arg(now)
            .arg(deadline)
            .arg(worker.to_string())
            .arg(self.queue_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn mark_finished(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.mark_terminal(worker, url, "done").await
    }

    async fn mark_failed(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.mark_terminal(worker, url, "failed").await
    }

    async fn mark_excluded(&self, worker: &WorkerId, url: &str) -> Result<bool, StoreError> {
        self.mark_terminal(worker, url, "excluded").await
    }

    async fn clear_own_pending_locks(&self, hostname: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .clear_script
            .key(self.key("po"))
            .key(self.key("pe"))
            .key(self.key("qd"))
            .key(self.key("pd"))
            .arg(format!("{}#", hostname))
            .arg(self.queue_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn add_extra_seed(&self, orig_seed_id: usize, url: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let id: i64 = self
            .extra_seed_script
            .key(self.key("extra"))
            .arg(orig_seed_id)
            .arg(url)
            .arg(self.original_seed_count)
            .invoke_async(&mut conn)
            .await?;
        Ok(id as usize)
    }

    async fn extra_seeds(&self) -> Result<Vec<ExtraSeed>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(self.key("extra"), 0, -1).await?;
        items
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn mark_sitemap_done(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key("smd"), 1).await?;
        Ok(())
    }

    async fn is_sitemap_done(&self) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let done: Option<u32> = conn.get(self.key("smd")).await?;
        Ok(done == Some(1))
    }

    async fn set_status(&self, status: CrawlStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key("status"), status.to_string()).await?;
        Ok(())
    }

    async fn get_status(&self) -> Result<CrawlStatus, StoreError> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn.get(self.key("status")).await?;
        match status.as_deref() {
            None => Ok(CrawlStatus::Running),
            Some(s) => serde_json::from_value(serde_json::Value::String(s.to_string()))
                .map_err(|_| StoreError::Backend(format!("unknown crawl status: {s}"))),
        }
    }

    async fn queue_size(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut total = 0usize;
        for depth in self.queue_depths().await? {
            let len: usize = conn
                .llen(format!("{}{}", self.queue_key_prefix(), depth))
                .await?;
            total += len;
        }
        Ok(total)
    }

    async fn num_pending(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(self.key("po")).await?)
    }

    async fn num_done(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.key("done")).await?)
    }

    async fn num_failed(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.key("failed")).await?)
    }

    async fn num_seen(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.key("seen")).await?)
    }

    async fn pending_list(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.hvals(self.key("pe")).await?;
        entries
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn set_archive_size(&self, bytes: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key("size"), bytes).await?;
        Ok(())
    }

    async fn archive_size(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let size: Option<u64> = conn.get(self.key("size")).await?;
        Ok(size.unwrap_or(0))
    }

    async fn snapshot(&self) -> Result<StateSnapshot, StoreError> {
        let mut conn = self.conn.clone();
        let mut queued: BTreeMap<u32, Vec<QueueEntry>> = BTreeMap::new();
        // In-progress entries first so a restart re-serves them.
        for entry in self.pending_list().await? {
            queued.entry(entry.depth).or_default().push(entry);
        }
        for depth in self.queue_depths().await? {
            let items: Vec<String> = conn
                .lrange(format!("{}{}", self.queue_key_prefix(), depth), 0, -1)
                .await?;
            let bucket = queued.entry(depth).or_default();
            for json in items {
                bucket.push(serde_json::from_str(&json)?);
            }
        }
        Ok(StateSnapshot {
            queued,
            seen: self.set_members("seen").await?,
            done: self.set_members("done").await?,
            failed: self.set_members("failed").await?,
            excluded: self.set_members("excluded").await?,
            extra_seeds: self.extra_seeds().await?,
            sitemap_done: self.is_sitemap_done().await?,
            status: self.get_status().await?,
            archive_size: self.archive_size().await?,
        })
    }

    async fn load(&self, snapshot: StateSnapshot, resume: bool) -> Result<(), StoreError> {
        self.clear_all().await?;
        let mut conn = self.conn.clone();
        for set in [
            ("done", &snapshot.done),
            ("failed", &snapshot.failed),
            ("excluded", &snapshot.excluded),
        ] {
            if !set.1.is_empty() {
                let _: () = conn.sadd(self.key(set.0), set.1).await?;
            }
        }
        let mut seen = snapshot.seen.clone();
        if !resume {
            // Fresh run over old state: only terminal URLs stay deduped.
            let queued_urls: std::collections::HashSet<&String> =
                snapshot.queued.values().flatten().map(|e| &e.url).collect();
            let terminal: std::collections::HashSet<&String> = snapshot
                .done
                .iter()
                .chain(&snapshot.failed)
                .chain(&snapshot.excluded)
                .collect();
            seen.retain(|url| !queued_urls.contains(url) || terminal.contains(url));
        }
        if !seen.is_empty() {
            let _: () = conn.sadd(self.key("seen"), &seen).await?;
        }
        if resume {
            for (depth, entries) in &snapshot.queued {
                let key = format!("{}{}", self.queue_key_prefix(), depth);
                for entry in entries {
                    let _: () = conn.rpush(&key, serde_json::to_string(entry)?).await?;
                }
                let _: () = conn.zadd(self.key("qd"), depth, depth).await?;
            }
        }
        for extra in &snapshot.extra_seeds {
            let _: () = conn
                .rpush(self.key("extra"), serde_json::to_string(extra)?)
                .await?;
        }
        if snapshot.sitemap_done {
            let _: () = conn.set(self.key("smd"), 1).await?;
        }
        let _: () = conn
            .set(self.key("status"), CrawlStatus::Running.to_string())
            .await?;
        let _: () = conn.set(self.key("size"), snapshot.archive_size).await?;
        Ok(())
    }

    async fn next_control_message(&self) -> Result<Option<ControlCommand>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(self.key("msg"), None).await?;
        match raw {
            None => Ok(None),
            Some(json) => match serde_json::from_str(&json) {
                Ok(cmd) => Ok(Some(cmd)),
                Err(e) => {
                    warn!(target: "state", "ignoring malformed control message: {}", e);
                    Ok(None)
                }
            },
        }
    }

    async fn push_control_message(&self, cmd: ControlCommand) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(self.key("msg"), serde_json::to_string(&cmd)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CrawlStore;
    use std::sync::Arc;

    // These exercise the redis backend only when an instance is reachable,
    // mirroring how the queue is used in production. Skipped otherwise.
    async fn connect() -> Option<RedisBackend> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        match tokio::time::timeout(
            Duration::from_secs(1),
            RedisBackend::connect(&url, "sitecap-test", 1, true),
        )
        .await
        {
            Ok(Ok(backend)) => Some(backend),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_redis_queue_round_trip() {
        let Some(backend) = connect().await else {
            println!("redis not available, skipping");
            return;
        };
        let store = CrawlStore::new(
            Arc::new(backend),
            "sitecap-test",
            Duration::from_secs(30),
            None,
        );
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/a", 0, 1, 0))
                .await
                .unwrap(),
            AddResult::Added
        );
        assert_eq!(
            store
                .add_to_queue(QueueEntry::new("https://s/root", 0, 0, 0))
                .await
                .unwrap(),
            AddResult::Added
        );
        let w = WorkerId::new("test-host", 0);
        let first = store.next_from_queue(&w).await.unwrap().unwrap();
        assert_eq!(first.url, "https://s/root");
        assert!(store.mark_finished(&w, &first.url).await.unwrap());
        assert_eq!(store.num_done().await.unwrap(), 1);
    }
}
