//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{ConfigError, CrawlConfig, SeedConfig};

/// sitecap cli
#[derive(Parser)]
#[command(name = "sitecap")]
#[command(about = "Browser-driven web crawler that captures an archive on disk")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl
    Crawl {
        #[command(flatten)]
        opts: CrawlArgs,
    },

    /// Parse the configuration, validate it, and print the effective YAML
    Validate {
        #[command(flatten)]
        opts: CrawlArgs,
    },
}

#[derive(Args, Debug, Default)]
pub struct CrawlArgs {
    /// YAML config file; '-' reads from stdin
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seed URL (may be repeated)
    #[arg(long)]
    pub url: Vec<String>,

    /// File with one seed URL per line
    #[arg(long)]
    pub seed_file: Option<PathBuf>,

    /// Number of browser workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum pages to crawl
    #[arg(long)]
    pub page_limit: Option<usize>,

    /// Wall-clock limit in seconds
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Archive size limit in bytes
    #[arg(long)]
    pub size_limit: Option<u64>,

    /// Collection name for the on-disk layout
    #[arg(long)]
    pub collection: Option<String>,

    /// Working directory holding collections/
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Redis URL for the shared crawl store
    #[arg(long)]
    pub redis_store_url: Option<String>,

    /// Drop any previous store state for this crawl id before starting
    #[arg(long)]
    pub redis_store_clean: bool,

    /// Run the browser with a visible window
    #[arg(long)]
    pub headful: bool,

    /// Crawl and queue but write nothing to the archive
    #[arg(long)]
    pub dry_run: bool,

    /// User agent override
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Logging flags (e.g. debug)
    #[arg(long, value_delimiter = ',')]
    pub logging: Vec<String>,

    /// Only log these contexts
    #[arg(long, value_delimiter = ',')]
    pub log_context: Vec<String>,

    /// Never log these contexts
    #[arg(long, value_delimiter = ',')]
    pub log_exclude_context: Vec<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl CrawlArgs {
    /// Assemble the effective configuration: YAML file first, CLI overrides
    /// on top, then validation.
    pub fn build_config(&self) -> Result<CrawlConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => CrawlConfig::from_yaml_path(path)?,
            None => CrawlConfig::default(),
        };
        for url in &self.url {
            config.seeds.push(SeedConfig::from_url(url.clone()));
        }
        if let Some(seed_file) = &self.seed_file {
            config.seed_file = Some(seed_file.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(page_limit) = self.page_limit {
            config.page_limit = page_limit;
        }
        if let Some(time_limit) = self.time_limit {
            config.time_limit = time_limit;
        }
        if let Some(size_limit) = self.size_limit {
            config.size_limit = size_limit;
        }
        if let Some(collection) = &self.collection {
            config.collection = Some(collection.clone());
        }
        if let Some(cwd) = &self.cwd {
            config.cwd = Some(cwd.clone());
        }
        if let Some(redis_url) = &self.redis_store_url {
            config.redis_store_url = Some(redis_url.clone());
        }
        if self.redis_store_clean {
            config.redis_store_clean = true;
        }
        if self.headful {
            config.headless = false;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if !self.logging.is_empty() {
            config.logging = self.logging.clone();
        }
        if !self.log_context.is_empty() {
            config.log_context = self.log_context.clone();
        }
        if !self.log_exclude_context.is_empty() {
            config.log_exclude_context = self.log_exclude_context.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
