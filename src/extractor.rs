//! Selector-based link extraction across a page's eligible frames.
//!
//! Every candidate URL, whether collected by a selector or pushed through the
//! `__addLink` host callback, is funneled through the same scope check and
//! enqueue path. Deduplication is the store's job, not ours.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::browser::Window;
use crate::config::Limits;
use crate::scope::ScopeEngine;
use crate::store::{AddResult, CrawlStore, QueueEntry};

/// One extraction rule: CSS selector plus the attribute or DOM property that
/// yields the URL. Written as `css->@attr` (attribute) or `css->prop`
/// (property); a bare selector reads the `href` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSelector {
    pub selector: String,
    pub name: String,
    pub is_attribute: bool,
}

impl LinkSelector {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once("->") {
            None => Some(Self {
                selector: spec.to_string(),
                name: "href".to_string(),
                is_attribute: true,
            }),
            Some((selector, target)) => {
                let selector = selector.trim();
                let target = target.trim();
                if selector.is_empty() || target.is_empty() {
                    return None;
                }
                let (name, is_attribute) = match target.strip_prefix('@') {
                    Some(attr) => (attr.to_string(), true),
                    None => (target.to_string(), false),
                };
                Some(Self {
                    selector: selector.to_string(),
                    name,
                    is_attribute,
                })
            }
        }
    }

    /// Parse a selector list, dropping malformed entries with a warning.
    pub fn parse_all(specs: &[String]) -> Vec<Self> {
        specs
            .iter()
            .filter_map(|spec| {
                let parsed = Self::parse(spec);
                if parsed.is_none() {
                    warn!(target: "links", "ignoring malformed link selector: {:?}", spec);
                }
                parsed
            })
            .collect()
    }
}

/// Totals for one page's extraction pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractStats {
    pub extracted: usize,
    pub queued: usize,
    pub dupes: usize,
    pub rejected: usize,
    pub limit_hit: bool,
}

pub struct LinkExtractor {
    scope: Arc<ScopeEngine>,
    store: Arc<CrawlStore>,
}

impl LinkExtractor {
    pub fn new(scope: Arc<ScopeEngine>, store: Arc<CrawlStore>) -> Self {
        Self { scope, store }
    }

    /// Run the selector set in every filtered frame of the page. A frame or
    /// selector that times out does not affect the others.
    pub async fn extract(
        &self,
        window: &dyn Window,
        parent: &QueueEntry,
        frames: &[crate::browser::FrameInfo],
        selectors: &[LinkSelector],
    ) -> ExtractStats {
        let mut stats = ExtractStats::default();
        let op_timeout = Duration::from_secs(Limits::PAGE_OP_TIMEOUT_SECS);

        for frame in frames {
            for selector in selectors {
                let result = tokio::time::timeout(
                    op_timeout,
                    window.extract_attributes(
                        &frame.id,
                        &selector.selector,
                        &selector.name,
                        selector.is_attribute,
                    ),
                )
                .await;
                let values = match result {
                    Ok(Ok(values)) => values,
                    Ok(Err(e)) => {
                        warn!(
                            target: "links",
                            "extraction failed in frame {}: {}", frame.url, e
                        );
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            target: "links",
                            "extraction timed out in frame {}", frame.url
                        );
                        continue;
                    }
                };
                stats.extracted += values.len();
                for raw in values {
                    let absolute = resolve_against(&raw, &frame.url);
                    let Some(absolute) = absolute else {
                        stats.rejected += 1;
                        continue;
                    };
                    self.queue_candidate(parent, absolute.as_str(), &mut stats)
                        .await;
                }
            }
        }
        debug!(
            target: "links",
            "extracted {} urls, queued {} ({} dupes, {} rejected)",
            stats.extracted, stats.queued, stats.dupes, stats.rejected
        );
        stats
    }

    /// Scope-check one candidate discovered from `parent` and enqueue it.
    ///
    /// Children are offered at `depth + 1`; an out-of-scope acceptance
    /// consumes an extra hop, an in-scope one keeps the parent's count.
    pub async fn queue_candidate(
        &self,
        parent: &QueueEntry,
        candidate: &str,
        stats: &mut ExtractStats,
    ) {
        let depth = parent.depth + 1;
        let Some(hit) =
            self.scope
                .is_included(parent.seed_id, candidate, depth, parent.extra_hops + 1, false)
        else {
            stats.rejected += 1;
            return;
        };
        let extra_hops = if hit.is_oos {
            parent.extra_hops + 1
        } else {
            parent.extra_hops
        };
        let entry = QueueEntry::new(hit.url.as_str(), parent.seed_id, depth, extra_hops);
        match self.store.add_to_queue(entry).await {
            Ok(AddResult::Added) => stats.queued += 1,
            Ok(AddResult::DupeUrl) => stats.dupes += 1,
            Ok(AddResult::LimitHit) => {
                if !stats.limit_hit {
                    debug!(target: "links", "page limit reached, dropping further links");
                }
                stats.limit_hit = true;
            }
            Err(e) => {
                warn!(target: "links", "enqueue failed for {}: {}", candidate, e);
            }
        }
    }
}

/// Resolve a possibly-relative URL against its frame's URL.
fn resolve_against(raw: &str, base: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(raw) {
        return Some(url);
    }
    Url::parse(base).ok()?.join(raw).ok()
}
