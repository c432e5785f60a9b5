//! Crawl configuration.
//!
//! A `CrawlConfig` is assembled once (CLI + YAML file + seed file), validated,
//! and then distributed by value into every component at construction. Nothing
//! mutates it after the crawl starts; runtime state lives in the crawl store.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::ScopeType;

/// Fixed operational constants shared across components.
pub struct Limits;

impl Limits {
    /// Hard timeout for a single in-page operation (frame eval, extraction).
    pub const PAGE_OP_TIMEOUT_SECS: u64 = 5;
    /// Maximum successive same-origin pages served by one window.
    pub const MAX_WINDOW_REUSE: u32 = 5;
    /// Cap substituted for an unbounded (`depth: -1`) seed depth.
    pub const MAX_DEPTH: u32 = 1_000_000;
    /// Sitemap ingestion resolves its initial call after this many URLs.
    pub const SITEMAP_INITIAL_URLS: usize = 100;
    /// Fetch attempts per sitemap URL before it is skipped.
    pub const SITEMAP_FETCH_ATTEMPTS: u32 = 3;
    /// Worker sleep between queue polls while other workers still hold URLs.
    pub const WORKER_IDLE_POLL_MS: u64 = 500;
    /// A second interrupt inside this window forces a hard stop.
    pub const HARD_STOP_WINDOW_MS: u64 = 200;
    /// How long the driver will poll for an anti-bot interstitial to clear.
    pub const ANTI_BOT_MAX_WAIT_SECS: u64 = 30;
    /// Poll interval while an interstitial is present.
    pub const ANTI_BOT_POLL_SECS: u64 = 5;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no seeds configured: provide url, seeds, or seedFile")]
    NoSeeds,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// When navigation is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    Load,
    Domcontentloaded,
    Networkidle0,
    Networkidle2,
}

/// Checkpoint policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SaveStateMode {
    Never,
    /// Write a checkpoint only on interruption.
    #[default]
    Partial,
    /// Write checkpoints during the crawl on the configured interval.
    Always,
}

/// Basic-auth credentials attached to a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// One seed record as it appears in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedConfig {
    pub url: String,
    pub scope_type: Option<ScopeType>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// `-1` means unbounded (capped at `Limits::MAX_DEPTH`).
    pub depth: Option<i64>,
    pub extra_hops: u32,
    /// Sitemap URL, or the literal `"detect"` to probe robots.txt.
    pub sitemap: Option<String>,
    pub auth: Option<AuthConfig>,
    pub select_links: Vec<String>,
    pub page_limit: Option<usize>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            scope_type: None,
            include: Vec::new(),
            exclude: Vec::new(),
            depth: None,
            extra_hops: 0,
            sitemap: None,
            auth: None,
            select_links: Vec::new(),
            page_limit: None,
        }
    }
}

impl SeedConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Request block rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BlockRuleType {
    #[default]
    Block,
    AllowOnly,
}

/// A single request block rule applied during interception.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockRule {
    /// Regex matched against the request URL.
    pub url: String,
    #[serde(rename = "type")]
    pub rule_type: BlockRuleType,
    /// Restrict the rule to requests issued from frames whose URL matches.
    pub in_frame_url: Option<String>,
}

impl Default for BlockRule {
    fn default() -> Self {
        Self {
            url: String::new(),
            rule_type: BlockRuleType::Block,
            in_frame_url: None,
        }
    }
}

/// Full crawl configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlConfig {
    // Seeding
    pub url: Option<String>,
    pub seeds: Vec<SeedConfig>,
    pub seed_file: Option<PathBuf>,

    // Limits (0 = unset)
    pub page_limit: usize,
    pub max_page_limit: usize,
    pub size_limit: u64,
    pub time_limit: u64,
    pub disk_utilization: u32,
    pub fail_on_failed_limit: usize,

    // Timing (seconds)
    pub page_load_timeout: u64,
    pub behavior_timeout: u64,
    pub page_extra_delay: u64,
    pub post_load_delay: u64,
    pub net_idle_wait: u64,
    pub wait_until: WaitUntil,

    // Workers
    pub workers: usize,
    pub headless: bool,
    pub profile: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub user_agent_suffix: Option<String>,
    pub lang: Option<String>,
    pub mobile_device: Option<String>,

    // Request rules
    pub block_ads: bool,
    pub ad_block_message: Option<String>,
    pub block_rules: Vec<BlockRule>,
    pub block_message: Option<String>,
    pub origin_override: Vec<String>,

    // Behaviors
    pub behavior_opts: Option<serde_json::Value>,
    pub custom_behaviors: Vec<PathBuf>,
    pub enable_behaviors: bool,

    // Failure policy
    pub fail_on_failed_seed: bool,
    pub fail_on_invalid_status: bool,
    pub restarts_on_error: bool,
    pub wait_on_done: bool,

    // Persistence
    pub save_state: SaveStateMode,
    pub save_state_interval: u64,
    pub save_state_history: usize,
    pub redis_store_url: Option<String>,
    pub redis_store_clean: bool,
    /// Escalate store errors during the run to fatal instead of retrying.
    pub exit_on_redis_error: bool,

    // Sitemap
    pub sitemap_from_date: Option<NaiveDate>,
    pub sitemap_to_date: Option<NaiveDate>,

    // Link selection (global default, overridable per seed)
    pub select_links: Vec<String>,

    // Logging
    pub logging: Vec<String>,
    pub log_context: Vec<String>,
    pub log_exclude_context: Vec<String>,

    // Misc
    pub collection: Option<String>,
    pub cwd: Option<PathBuf>,
    pub overwrite: bool,
    pub dry_run: bool,
    pub recrawl_update_data: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            url: None,
            seeds: Vec::new(),
            seed_file: None,
            page_limit: 0,
            max_page_limit: 0,
            size_limit: 0,
            time_limit: 0,
            disk_utilization: 90,
            fail_on_failed_limit: 0,
            page_load_timeout: 90,
            behavior_timeout: 90,
            page_extra_delay: 0,
            post_load_delay: 0,
            net_idle_wait: 10,
            wait_until: WaitUntil::Load,
            workers: 1,
            headless: true,
            profile: None,
            user_agent: None,
            user_agent_suffix: None,
            lang: None,
            mobile_device: None,
            block_ads: false,
            ad_block_message: None,
            block_rules: Vec::new(),
            block_message: None,
            origin_override: Vec::new(),
            behavior_opts: None,
            custom_behaviors: Vec::new(),
            enable_behaviors: true,
            fail_on_failed_seed: false,
            fail_on_invalid_status: false,
            restarts_on_error: false,
            wait_on_done: false,
            save_state: SaveStateMode::Partial,
            save_state_interval: 300,
            save_state_history: 5,
            redis_store_url: None,
            redis_store_clean: false,
            exit_on_redis_error: false,
            sitemap_from_date: None,
            sitemap_to_date: None,
            select_links: Vec::new(),
            logging: Vec::new(),
            log_context: Vec::new(),
            log_exclude_context: Vec::new(),
            collection: None,
            cwd: None,
            overwrite: false,
            dry_run: false,
            recrawl_update_data: false,
        }
    }
}

impl CrawlConfig {
    /// Read a YAML config file; `-` reads from stdin.
    pub fn from_yaml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = if path == Path::new("-") {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|source| ConfigError::Io {
                    path: "<stdin>".into(),
                    source,
                })?;
            buf
        } else {
            fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?
        };
        let config: Self = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// Collect all seed records: `url`, `seeds[]`, then `seedFile` lines.
    pub fn resolve_seeds(&self) -> Result<Vec<SeedConfig>, ConfigError> {
        let mut out = Vec::new();
        if let Some(url) = &self.url {
            out.push(SeedConfig::from_url(url.clone()));
        }
        out.extend(self.seeds.iter().cloned());
        if let Some(seed_file) = &self.seed_file {
            let text = fs::read_to_string(seed_file).map_err(|source| ConfigError::Io {
                path: seed_file.display().to_string(),
                source,
            })?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                out.push(SeedConfig::from_url(line));
            }
        }
        if out.is_empty() {
            return Err(ConfigError::NoSeeds);
        }
        Ok(out)
    }

    /// Validate cross-field constraints and clamp `pageLimit` to `maxPageLimit`.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be >= 1".into()));
        }
        if self.disk_utilization > 100 {
            return Err(ConfigError::Invalid(
                "diskUtilization must be a percentage (0-100)".into(),
            ));
        }
        if self.max_page_limit > 0 && (self.page_limit == 0 || self.page_limit > self.max_page_limit)
        {
            self.page_limit = self.max_page_limit;
        }
        if let (Some(from), Some(to)) = (self.sitemap_from_date, self.sitemap_to_date) {
            if from > to {
                return Err(ConfigError::Invalid(
                    "sitemapFromDate is after sitemapToDate".into(),
                ));
            }
        }
        Ok(())
    }

    /// Stable crawl id: `CRAWL_ID` env, then collection name, then a timestamp id.
    pub fn crawl_id(&self) -> String {
        if let Ok(id) = std::env::var("CRAWL_ID") {
            if !id.is_empty() {
                return id;
            }
        }
        self.collection
            .clone()
            .unwrap_or_else(|| format!("crawl-{}", Utc::now().format("%Y%m%d%H%M%S")))
    }

    /// Collection name used in the on-disk layout.
    pub fn collection_name(&self) -> String {
        self.collection.clone().unwrap_or_else(|| self.crawl_id())
    }

    /// Root of the collection: `<cwd>/collections/<collection>`.
    pub fn collection_dir(&self) -> PathBuf {
        let cwd = self.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
        cwd.join("collections").join(self.collection_name())
    }

    /// Store location: `redisStoreUrl`, then `REDIS_URL`/`REDIS_URL_DOCKER` env.
    pub fn store_url(&self) -> Option<String> {
        self.redis_store_url
            .clone()
            .or_else(|| std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()))
            .or_else(|| {
                std::env::var("REDIS_URL_DOCKER")
                    .ok()
                    .filter(|s| !s.is_empty())
            })
    }

    /// Upper bound on one page's wall time; also the queue lock TTL.
    pub fn max_page_time(&self) -> Duration {
        Duration::from_secs(
            self.page_load_timeout
                + self.behavior_timeout
                + 2 * Limits::PAGE_OP_TIMEOUT_SECS
                + self.page_extra_delay,
        )
    }

    /// Effective page limit as an `Option`.
    pub fn page_limit_opt(&self) -> Option<usize> {
        if self.page_limit > 0 {
            Some(self.page_limit)
        } else {
            None
        }
    }

    /// Link selectors for a seed: per-seed override, global, or `a[href]->href`.
    pub fn link_selectors_for(&self, seed_selectors: &[String]) -> Vec<String> {
        if !seed_selectors.is_empty() {
            seed_selectors.to_vec()
        } else if !self.select_links.is_empty() {
            self.select_links.clone()
        } else {
            vec!["a[href]->@href".to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CrawlConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.page_load_timeout, 90);
        assert_eq!(config.save_state, SaveStateMode::Partial);
        assert_eq!(config.disk_utilization, 90);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
seeds:
  - url: https://example.com/
    scopeType: prefix
    depth: 2
    extraHops: 1
pageLimit: 100
workers: 4
waitUntil: domcontentloaded
saveState: always
"#;
        let config: CrawlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.seeds[0].depth, Some(2));
        assert_eq!(config.seeds[0].extra_hops, 1);
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.workers, 4);
        assert_eq!(config.wait_until, WaitUntil::Domcontentloaded);
        assert_eq!(config.save_state, SaveStateMode::Always);
    }

    #[test]
    fn test_seed_file_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "https://a.example/").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  https://b.example/  ").unwrap();

        let config = CrawlConfig {
            seed_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let seeds = config.resolve_seeds().unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].url, "https://a.example/");
        assert_eq!(seeds[1].url, "https://b.example/");
    }

    #[test]
    fn test_no_seeds_is_error() {
        let config = CrawlConfig::default();
        assert!(matches!(config.resolve_seeds(), Err(ConfigError::NoSeeds)));
    }

    #[test]
    fn test_max_page_limit_clamps() {
        let mut config = CrawlConfig {
            page_limit: 0,
            max_page_limit: 50,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.page_limit, 50);

        let mut config = CrawlConfig {
            page_limit: 500,
            max_page_limit: 50,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.page_limit, 50);
    }

    #[test]
    fn test_max_page_time() {
        let config = CrawlConfig {
            page_load_timeout: 60,
            behavior_timeout: 30,
            page_extra_delay: 5,
            ..Default::default()
        };
        assert_eq!(
            config.max_page_time(),
            Duration::from_secs(60 + 30 + 2 * Limits::PAGE_OP_TIMEOUT_SECS + 5)
        );
    }

    #[test]
    fn test_default_link_selector() {
        let config = CrawlConfig::default();
        assert_eq!(config.link_selectors_for(&[]), vec!["a[href]->@href"]);
        let per_seed = vec!["div.nav a->href".to_string()];
        assert_eq!(config.link_selectors_for(&per_seed), per_seed);
    }
}
