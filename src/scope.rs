//! Per-seed crawl scope: include/exclude rules, depth and extra-hops budgets,
//! and URL normalization.
//!
//! Seeds live in an append-only arena and are addressed by integer id
//! everywhere else in the crawler. Extra seeds (created when a seed URL
//! redirects off-origin) are appended with ids handed out by the crawl store
//! so numbering stays deterministic across restarts.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{AuthConfig, Limits, SeedConfig};

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("invalid seed URL {url}: {reason}")]
    InvalidSeedUrl { url: String, reason: String },
    #[error("unsupported scheme in seed URL: {0}")]
    UnsupportedScheme(String),
    #[error("invalid regex {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown seed id {0}")]
    UnknownSeed(usize),
}

/// How a seed's include rules are derived from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeType {
    /// Only the seed page itself.
    Page,
    /// The seed page plus same-page hash navigation (`#fragment` kept).
    PageSpa,
    /// Any URL under the seed's directory prefix.
    Prefix,
    /// Any URL on the seed's host.
    Host,
    /// Any URL on the seed's registered domain, including subdomains.
    Domain,
    /// Everything.
    Any,
    /// Caller-supplied include list.
    Custom,
}

/// Where a seed's sitemap comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapSpec {
    Url(Url),
    /// Probe robots.txt and conventional paths.
    Detect,
}

/// An accepted candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeHit {
    /// Normalized URL (fragment/credentials stripped as applicable).
    pub url: Url,
    /// True when acceptance consumed an extra out-of-scope hop.
    pub is_oos: bool,
}

/// A fully-resolved seed: starting URL plus compiled scope rules.
#[derive(Debug, Clone)]
pub struct Seed {
    pub id: usize,
    pub url: Url,
    pub scope_type: ScopeType,
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
    pub max_depth: u32,
    pub max_extra_hops: u32,
    pub allow_hash: bool,
    pub auth: Option<AuthConfig>,
    pub sitemap: Option<SitemapSpec>,
    pub select_links: Vec<String>,
    pub page_limit: Option<usize>,
    /// False for seeds materialized from a redirect.
    pub original: bool,
}

impl Seed {
    /// Build a seed from its config record.
    pub fn from_config(id: usize, config: &SeedConfig) -> Result<Self, ScopeError> {
        let scope_type = config.scope_type.unwrap_or(if config.include.is_empty() {
            ScopeType::Prefix
        } else {
            ScopeType::Custom
        });
        let allow_hash = scope_type == ScopeType::PageSpa;

        let mut url = parse_http_url(&config.url)?;
        if !allow_hash {
            url.set_fragment(None);
        }
        // Inline credentials become the auth config unless one was given.
        let auth = config.auth.clone().or_else(|| inline_auth(&url));
        strip_credentials(&mut url);

        let include = if scope_type == ScopeType::Custom {
            compile_patterns(&config.include)?
        } else {
            derive_include(scope_type, &url)?
        };
        let exclude = compile_patterns(&config.exclude)?;

        let max_depth = match config.depth {
            None | Some(-1) => Limits::MAX_DEPTH,
            Some(d) if d < -1 => Limits::MAX_DEPTH,
            Some(d) => (d as u64).min(Limits::MAX_DEPTH as u64) as u32,
        };

        let sitemap = match config.sitemap.as_deref() {
            None | Some("") => None,
            Some("detect") | Some("true") => Some(SitemapSpec::Detect),
            Some(raw) => Some(SitemapSpec::Url(parse_http_url(raw)?)),
        };

        Ok(Self {
            id,
            url,
            scope_type,
            include,
            exclude,
            max_depth,
            max_extra_hops: config.extra_hops,
            allow_hash,
            auth,
            sitemap,
            select_links: config.select_links.clone(),
            page_limit: config.page_limit,
            original: true,
        })
    }

    /// Materialize an extra seed: same scope configuration, new URL.
    ///
    /// Include rules are re-derived from the new URL so the landed origin is
    /// what the scope covers; a custom include list is kept as-is.
    pub fn rescoped(&self, new_id: usize, new_url: Url) -> Result<Self, ScopeError> {
        let mut url = new_url;
        if !self.allow_hash {
            url.set_fragment(None);
        }
        strip_credentials(&mut url);
        let include = if self.scope_type == ScopeType::Custom {
            self.include.clone()
        } else {
            derive_include(self.scope_type, &url)?
        };
        Ok(Self {
            id: new_id,
            url,
            include,
            exclude: self.exclude.clone(),
            original: false,
            sitemap: None,
            ..self.clone()
        })
    }

    /// True when no child of a page at `(depth, extra_hops)` could be accepted.
    pub fn is_at_max_depth(&self, depth: u32, extra_hops: u32) -> bool {
        depth >= self.max_depth && extra_hops >= self.max_extra_hops
    }
}

/// Append-only seed arena plus crawl-wide dynamic exclusions.
pub struct ScopeEngine {
    seeds: RwLock<Vec<Arc<Seed>>>,
    original_count: usize,
    dynamic_excludes: RwLock<Vec<Regex>>,
}

impl ScopeEngine {
    pub fn from_configs(configs: &[SeedConfig]) -> Result<Self, ScopeError> {
        let mut seeds = Vec::with_capacity(configs.len());
        for (id, config) in configs.iter().enumerate() {
            seeds.push(Arc::new(Seed::from_config(id, config)?));
        }
        Ok(Self {
            original_count: seeds.len(),
            seeds: RwLock::new(seeds),
            dynamic_excludes: RwLock::new(Vec::new()),
        })
    }

    pub fn seed(&self, id: usize) -> Option<Arc<Seed>> {
        self.seeds.read().get(id).cloned()
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.read().len()
    }

    pub fn original_count(&self) -> usize {
        self.original_count
    }

    /// Seeds snapshot, for iteration at startup.
    pub fn seeds(&self) -> Vec<Arc<Seed>> {
        self.seeds.read().clone()
    }

    /// Register an extra seed under the id assigned by the crawl store.
    ///
    /// Idempotent: an id below the current length is already registered.
    pub fn register_extra_seed(
        &self,
        id: usize,
        orig_seed_id: usize,
        url: Url,
    ) -> Result<Arc<Seed>, ScopeError> {
        let mut seeds = self.seeds.write();
        if let Some(existing) = seeds.get(id) {
            return Ok(existing.clone());
        }
        let orig = seeds
            .get(orig_seed_id)
            .cloned()
            .ok_or(ScopeError::UnknownSeed(orig_seed_id))?;
        debug_assert_eq!(id, seeds.len(), "extra seed ids must be appended in order");
        let seed = Arc::new(orig.rescoped(id, url)?);
        seeds.push(seed.clone());
        Ok(seed)
    }

    /// Add a crawl-wide exclusion (operator control channel).
    pub fn add_exclusion(&self, pattern: &str) -> Result<(), ScopeError> {
        let re = Regex::new(pattern).map_err(|source| ScopeError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        self.dynamic_excludes.write().push(re);
        Ok(())
    }

    /// Remove a previously-added exclusion by its exact pattern.
    pub fn remove_exclusion(&self, pattern: &str) {
        self.dynamic_excludes
            .write()
            .retain(|re| re.as_str() != pattern);
    }

    /// Decide whether `raw` is accepted for `seed_id` at the given position.
    ///
    /// `extra_hops` is the hop count the candidate would carry if accepted
    /// out-of-scope (callers pass the parent's count plus one for discovered
    /// links, zero for seeds and sitemap URLs). `no_oos` disables the
    /// extra-hops allowance entirely.
    pub fn is_included(
        &self,
        seed_id: usize,
        raw: &str,
        depth: u32,
        extra_hops: u32,
        no_oos: bool,
    ) -> Option<ScopeHit> {
        let seed = self.seed(seed_id)?;
        let url = normalize_candidate(raw, seed.allow_hash)?;
        let target = url.as_str();

        let mut is_oos = false;
        if target != seed.url.as_str() {
            let in_scope =
                depth <= seed.max_depth && seed.include.iter().any(|re| re.is_match(target));
            if !in_scope {
                if !no_oos && seed.max_extra_hops > 0 && extra_hops <= seed.max_extra_hops {
                    is_oos = true;
                } else {
                    return None;
                }
            }
        }

        if seed.exclude.iter().any(|re| re.is_match(target)) {
            return None;
        }
        if self
            .dynamic_excludes
            .read()
            .iter()
            .any(|re| re.is_match(target))
        {
            return None;
        }

        Some(ScopeHit { url, is_oos })
    }

    /// See [`Seed::is_at_max_depth`].
    pub fn is_at_max_depth(&self, seed_id: usize, depth: u32, extra_hops: u32) -> bool {
        self.seed(seed_id)
            .map(|seed| seed.is_at_max_depth(depth, extra_hops))
            .unwrap_or(true)
    }
}

/// Parse an absolute http(s) URL.
fn parse_http_url(raw: &str) -> Result<Url, ScopeError> {
    let url = Url::parse(raw).map_err(|e| ScopeError::InvalidSeedUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ScopeError::UnsupportedScheme(other.to_string())),
    }
}

/// Normalize a candidate URL: absolute, http(s), fragment and credentials
/// stripped as configured. Returns `None` for anything unparseable.
pub fn normalize_candidate(raw: &str, allow_hash: bool) -> Option<Url> {
    let mut url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if !allow_hash {
        url.set_fragment(None);
    }
    strip_credentials(&mut url);
    Some(url)
}

fn strip_credentials(url: &mut Url) {
    let _ = url.set_username("");
    let _ = url.set_password(None);
}

fn inline_auth(url: &Url) -> Option<AuthConfig> {
    if url.username().is_empty() {
        return None;
    }
    Some(AuthConfig {
        username: url.username().to_string(),
        password: url.password().unwrap_or("").to_string(),
    })
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ScopeError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ScopeError::InvalidRegex {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Derive the include rule set for a non-custom scope type.
///
/// The scheme of every derived rule is relaxed to `https?:` so http and https
/// variants of the same site stay in scope.
fn derive_include(scope_type: ScopeType, url: &Url) -> Result<Vec<Regex>, ScopeError> {
    let origin = url.origin().ascii_serialization();
    let pattern = match scope_type {
        ScopeType::Page => return Ok(Vec::new()),
        ScopeType::PageSpa => format!("^{}#.+", relax_scheme(&regex::escape(url.as_str()))),
        ScopeType::Prefix => {
            let path = url.path();
            let dir = match path.rfind('/') {
                Some(idx) => &path[..=idx],
                None => "/",
            };
            format!(
                "^{}",
                relax_scheme(&regex::escape(&format!("{}{}", origin, dir)))
            )
        }
        ScopeType::Host => format!("^{}/", relax_scheme(&regex::escape(&origin))),
        ScopeType::Domain => {
            let host = url.host_str().ok_or_else(|| ScopeError::InvalidSeedUrl {
                url: url.to_string(),
                reason: "no host".to_string(),
            })?;
            let host = host.strip_prefix("www.").unwrap_or(host);
            format!("^https?://([^/]+\\.)*{}/", regex::escape(host))
        }
        ScopeType::Any => ".*".to_string(),
        ScopeType::Custom => return Ok(Vec::new()),
    };
    let re = Regex::new(&pattern).map_err(|source| ScopeError::InvalidRegex { pattern, source })?;
    Ok(vec![re])
}

/// Rewrite an escaped `http://`/`https://` literal prefix to match either.
fn relax_scheme(escaped: &str) -> String {
    if let Some(rest) = escaped.strip_prefix("https://") {
        format!("https?://{}", rest)
    } else if let Some(rest) = escaped.strip_prefix("http://") {
        format!("https?://{}", rest)
    } else {
        escaped.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_for(config: SeedConfig) -> ScopeEngine {
        ScopeEngine::from_configs(&[config]).unwrap()
    }

    fn seed_config(url: &str, scope: ScopeType) -> SeedConfig {
        SeedConfig {
            scope_type: Some(scope),
            ..SeedConfig::from_url(url)
        }
    }

    #[test]
    fn test_prefix_scope() {
        let engine = engine_for(seed_config(
            "https://example.com/docs/intro",
            ScopeType::Prefix,
        ));
        assert!(engine
            .is_included(0, "https://example.com/docs/guide", 1, 0, false)
            .is_some());
        // http variant stays in scope
        assert!(engine
            .is_included(0, "http://example.com/docs/guide", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://example.com/other", 1, 0, false)
            .is_none());
    }

    #[test]
    fn test_host_scope() {
        let engine = engine_for(seed_config("https://example.com/start", ScopeType::Host));
        assert!(engine
            .is_included(0, "https://example.com/anywhere/else", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://sub.example.com/x", 1, 0, false)
            .is_none());
    }

    #[test]
    fn test_domain_scope_includes_subdomains() {
        let engine = engine_for(seed_config("https://www.example.com/", ScopeType::Domain));
        assert!(engine
            .is_included(0, "https://example.com/a", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://deep.sub.example.com/a", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://notexample.com/a", 1, 0, false)
            .is_none());
    }

    #[test]
    fn test_page_scope_only_seed() {
        let engine = engine_for(seed_config("https://example.com/page", ScopeType::Page));
        assert!(engine
            .is_included(0, "https://example.com/page", 0, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://example.com/page2", 1, 0, false)
            .is_none());
    }

    #[test]
    fn test_page_spa_keeps_hash() {
        let engine = engine_for(seed_config("https://example.com/app", ScopeType::PageSpa));
        let hit = engine
            .is_included(0, "https://example.com/app#section/2", 1, 0, false)
            .unwrap();
        assert_eq!(hit.url.fragment(), Some("section/2"));
        assert!(engine
            .is_included(0, "https://example.com/other", 1, 0, false)
            .is_none());
    }

    #[test]
    fn test_fragment_stripped_outside_spa() {
        let engine = engine_for(seed_config("https://example.com/", ScopeType::Host));
        let hit = engine
            .is_included(0, "https://example.com/a#frag", 1, 0, false)
            .unwrap();
        assert_eq!(hit.url.as_str(), "https://example.com/a");
    }

    #[test]
    fn test_depth_budget() {
        let engine = engine_for(SeedConfig {
            depth: Some(1),
            ..seed_config("https://example.com/", ScopeType::Host)
        });
        assert!(engine
            .is_included(0, "https://example.com/a", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://example.com/b", 2, 0, false)
            .is_none());
    }

    #[test]
    fn test_extra_hops_budget() {
        let engine = engine_for(SeedConfig {
            extra_hops: 1,
            ..seed_config("https://example.com/", ScopeType::Host)
        });
        // One hop off-origin is allowed and flagged
        let hit = engine
            .is_included(0, "https://other.example/x", 1, 1, false)
            .unwrap();
        assert!(hit.is_oos);
        // A second consecutive hop exceeds the budget
        assert!(engine
            .is_included(0, "https://other.example/y", 2, 2, false)
            .is_none());
        // noOOS disables the allowance
        assert!(engine
            .is_included(0, "https://other.example/x", 1, 1, true)
            .is_none());
    }

    #[test]
    fn test_exclude_wins() {
        let engine = engine_for(SeedConfig {
            exclude: vec!["/admin/".to_string()],
            ..seed_config("https://example.com/", ScopeType::Host)
        });
        assert!(engine
            .is_included(0, "https://example.com/public", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(0, "https://example.com/admin/login", 1, 0, false)
            .is_none());
        // exclude also vetoes the seed URL itself
        assert!(engine
            .is_included(0, "https://example.com/admin/", 0, 0, false)
            .is_none());
    }

    #[test]
    fn test_dynamic_exclusions() {
        let engine = engine_for(seed_config("https://example.com/", ScopeType::Host));
        assert!(engine
            .is_included(0, "https://example.com/blocked", 1, 0, false)
            .is_some());
        engine.add_exclusion("/blocked").unwrap();
        assert!(engine
            .is_included(0, "https://example.com/blocked", 1, 0, false)
            .is_none());
        engine.remove_exclusion("/blocked");
        assert!(engine
            .is_included(0, "https://example.com/blocked", 1, 0, false)
            .is_some());
    }

    #[test]
    fn test_rejects_non_http() {
        let engine = engine_for(seed_config("https://example.com/", ScopeType::Any));
        assert!(engine
            .is_included(0, "ftp://example.com/file", 1, 0, false)
            .is_none());
        assert!(engine
            .is_included(0, "mailto:someone@example.com", 1, 0, false)
            .is_none());
        assert!(engine.is_included(0, "not a url", 1, 0, false).is_none());
    }

    #[test]
    fn test_credentials_stripped_into_auth() {
        let seed = Seed::from_config(
            0,
            &SeedConfig::from_url("https://user:pw@example.com/area/"),
        )
        .unwrap();
        assert_eq!(seed.url.as_str(), "https://example.com/area/");
        let auth = seed.auth.unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "pw");
    }

    #[test]
    fn test_unbounded_depth_capped() {
        let seed = Seed::from_config(
            0,
            &SeedConfig {
                depth: Some(-1),
                ..SeedConfig::from_url("https://example.com/")
            },
        )
        .unwrap();
        assert_eq!(seed.max_depth, Limits::MAX_DEPTH);
    }

    #[test]
    fn test_custom_scope_from_include_list() {
        let seed = Seed::from_config(
            0,
            &SeedConfig {
                include: vec!["^https?://example\\.com/docs/".to_string()],
                ..SeedConfig::from_url("https://example.com/")
            },
        )
        .unwrap();
        assert_eq!(seed.scope_type, ScopeType::Custom);
        assert_eq!(seed.include.len(), 1);
    }

    #[test]
    fn test_extra_seed_rescoped_to_landed_origin() {
        let engine = engine_for(seed_config("https://example.com/", ScopeType::Host));
        let landed = Url::parse("https://landed.example/welcome").unwrap();
        let extra = engine.register_extra_seed(1, 0, landed).unwrap();
        assert_eq!(extra.id, 1);
        assert!(!extra.original);
        assert!(engine
            .is_included(1, "https://landed.example/about", 1, 0, false)
            .is_some());
        assert!(engine
            .is_included(1, "https://example.com/about", 1, 0, false)
            .is_none());
        // registering the same id again is a no-op
        let again = engine
            .register_extra_seed(1, 0, Url::parse("https://elsewhere.example/").unwrap())
            .unwrap();
        assert_eq!(again.url.as_str(), "https://landed.example/welcome");
    }

    #[test]
    fn test_is_at_max_depth() {
        let engine = engine_for(SeedConfig {
            depth: Some(2),
            extra_hops: 1,
            ..seed_config("https://example.com/", ScopeType::Host)
        });
        assert!(!engine.is_at_max_depth(0, 1, 0));
        assert!(!engine.is_at_max_depth(0, 2, 0));
        assert!(engine.is_at_max_depth(0, 2, 1));
        assert!(engine.is_at_max_depth(0, 5, 9));
    }
}
