//! Browser-driven web crawler core.
//!
//! Seeds go in, a captured archive comes out: N page workers drive browser
//! windows against a shared depth-bucketed queue, a scope engine decides
//! which discovered URLs belong to the crawl, and the coordinator handles
//! seeding, sitemaps, limits, checkpoints and shutdown.

pub mod archive;
pub mod backoff;
pub mod browser;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod driver;
pub mod extractor;
pub mod logging;
pub mod page;
pub mod pool;
pub mod redis_store;
pub mod scope;
pub mod sitemap;
pub mod store;
pub mod worker;

#[cfg(feature = "browser")]
pub mod chrome;

// Re-export the main types for library usage
pub use browser::{Browser, BrowserLaunchOpts, Window};
pub use config::{CrawlConfig, SeedConfig};
pub use coordinator::{CrawlCoordinator, CrawlError, CrawlExit};
pub use page::{LoadState, PageState};
pub use scope::{ScopeEngine, ScopeType, Seed};
pub use store::{AddResult, CrawlStatus, CrawlStore, QueueEntry, StateSnapshot, WorkerId};
