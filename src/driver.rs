//! Drives a single browser window through one page's lifecycle: request
//! interception, navigation, anti-bot waits, behavior hooks, frame filtering.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::archive::Archive;
use crate::browser::{
    BrowserError, FrameInfo, GotoOptions, NavError, NavResponse, RequestDecision, RequestInfo,
    RequestPolicy, ResourceType, Window,
};
use crate::config::{BlockRuleType, CrawlConfig, Limits};
use crate::scope::Seed;

/// Host patterns classified as ads when `blockAds` is on.
const AD_HOSTS: &[&str] = &[
    r"(^|\.)doubleclick\.net$",
    r"(^|\.)googlesyndication\.com$",
    r"(^|\.)googletagservices\.com$",
    r"(^|\.)adservice\.google\.[a-z.]+$",
    r"(^|\.)adnxs\.com$",
];

/// Interstitial the anti-bot check polls for.
const ANTI_BOT_PROBE: &str =
    "document.querySelector('div.cf-browser-verification') !== null";

/// Optional hooks defined by injected behavior scripts.
const AWAIT_PAGE_LOAD: &str =
    "self.__sitecap_awaitPageLoad ? self.__sitecap_awaitPageLoad() : true";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid block rule regex {pattern}: {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid originOverride entry: {0} (expected <from>=<to>)")]
    InvalidOverride(String),
    #[error("cannot read behavior script {}: {source}", path.display())]
    BehaviorScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a navigation ended, strongest signal first.
#[derive(Debug)]
pub enum NavOutcome {
    Ok(NavResponse),
    /// Aborted navigation with a non-HTML content type: the asset itself is
    /// the capture, the page counts as fully loaded.
    DownloadDetected { mime: String },
    /// DOM content arrived but full load timed out; extraction proceeds,
    /// behaviors are skipped.
    SlowPage(Option<NavResponse>),
    LoadFailed(String),
    ChromeError,
    HttpError(u16),
}

struct CompiledRule {
    url: Regex,
    rule_type: BlockRuleType,
    in_frame_url: Option<Regex>,
}

pub struct PageDriver {
    config: Arc<CrawlConfig>,
    archive: Arc<Archive>,
    block_rules: Vec<CompiledRule>,
    ad_hosts: Vec<Regex>,
    origin_overrides: Vec<(String, String)>,
    behavior_script: Option<String>,
}

impl PageDriver {
    pub fn new(config: Arc<CrawlConfig>, archive: Arc<Archive>) -> Result<Self, DriverError> {
        let block_rules = config
            .block_rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    url: Regex::new(&rule.url).map_err(|source| DriverError::InvalidRule {
                        pattern: rule.url.clone(),
                        source,
                    })?,
                    rule_type: rule.rule_type,
                    in_frame_url: rule
                        .in_frame_url
                        .as_deref()
                        .map(|p| {
                            Regex::new(p).map_err(|source| DriverError::InvalidRule {
                                pattern: p.to_string(),
                                source,
                            })
                        })
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, DriverError>>()?;

        let ad_hosts = AD_HOSTS
            .iter()
            .map(|p| Regex::new(p).map_err(|source| DriverError::InvalidRule {
                pattern: p.to_string(),
                source,
            }))
            .collect::<Result<Vec<_>, DriverError>>()?;

        let origin_overrides = config
            .origin_override
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(from, to)| (from.to_string(), to.to_string()))
                    .ok_or_else(|| DriverError::InvalidOverride(entry.clone()))
            })
            .collect::<Result<Vec<_>, DriverError>>()?;

        // Custom behaviors are data: concatenate the configured scripts once.
        let behavior_script = if config.custom_behaviors.is_empty() {
            None
        } else {
            let mut combined = String::new();
            for path in &config.custom_behaviors {
                let text = fs::read_to_string(path).map_err(|source| DriverError::BehaviorScript {
                    path: path.clone(),
                    source,
                })?;
                combined.push_str(&text);
                combined.push('\n');
            }
            Some(combined)
        };

        Ok(Self {
            config,
            archive,
            block_rules,
            ad_hosts,
            origin_overrides,
            behavior_script,
        })
    }

    /// Install interception, host callbacks, behavior scripts, and auth
    /// headers on a fresh window. `target` is shared with the owning worker,
    /// which points it at each successive page the window serves.
    pub async fn prepare(
        &self,
        window: &dyn Window,
        seed: &Seed,
        target: Arc<Mutex<Url>>,
        resources: Arc<Mutex<Vec<String>>>,
        link_sink: mpsc::UnboundedSender<String>,
        behavior_log_sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), BrowserError> {
        window
            .set_request_policy(self.request_policy(target, resources))
            .await?;
        window.expose_callback("__addLink", link_sink).await?;
        window
            .expose_callback("__behaviorLog", behavior_log_sink)
            .await?;

        if let Some(script) = &self.behavior_script {
            window.add_init_script(script).await?;
        }

        let mut headers = Vec::new();
        if let Some(auth) = &seed.auth {
            let credentials = BASE64.encode(format!("{}:{}", auth.username, auth.password));
            headers.push(("Authorization".to_string(), format!("Basic {}", credentials)));
        }
        if let Some(lang) = &self.config.lang {
            headers.push(("Accept-Language".to_string(), lang.clone()));
        }
        if !headers.is_empty() {
            window.set_extra_headers(headers).await?;
        }
        Ok(())
    }

    /// Navigate and classify the result.
    pub async fn navigate(&self, window: &dyn Window, url: &Url) -> NavOutcome {
        let opts = GotoOptions {
            wait_until: self.config.wait_until,
            timeout: Duration::from_secs(self.config.page_load_timeout),
        };
        match window.navigate(url.as_str(), &opts).await {
            Ok(response) => {
                // A chrome-error:// URL after goto means the load never
                // produced a real document.
                match window.current_url().await {
                    Ok(current) if current.starts_with("chrome-error://") => {
                        return NavOutcome::ChromeError;
                    }
                    _ => {}
                }
                if response.status >= 400 && self.config.fail_on_invalid_status {
                    return NavOutcome::HttpError(response.status);
                }
                NavOutcome::Ok(response)
            }
            Err(NavError::Aborted { mime: Some(mime) }) if !is_html_mime(&mime) => {
                NavOutcome::DownloadDetected { mime }
            }
            Err(NavError::Aborted { mime }) => {
                NavOutcome::LoadFailed(format!("navigation aborted (mime={:?})", mime))
            }
            Err(NavError::Timeout {
                content_loaded: true,
            }) => NavOutcome::SlowPage(None),
            Err(NavError::Timeout { .. }) => {
                NavOutcome::LoadFailed("navigation timed out before content loaded".into())
            }
            Err(NavError::Crashed) => NavOutcome::LoadFailed("window crashed".into()),
            Err(e) => NavOutcome::LoadFailed(e.to_string()),
        }
    }

    /// Poll for a known interstitial and wait it out. Best-effort: evaluation
    /// errors end the check.
    pub async fn check_anti_bot(&self, window: &dyn Window, main_frame: &FrameInfo) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(Limits::ANTI_BOT_MAX_WAIT_SECS);
        loop {
            let present = match window.evaluate(&main_frame.id, ANTI_BOT_PROBE).await {
                Ok(value) => value.as_bool().unwrap_or(false),
                Err(_) => false,
            };
            if !present {
                return;
            }
            debug!(target: "driver", "anti-bot interstitial present, waiting");
            if tokio::time::Instant::now() >= deadline {
                warn!(target: "driver", "anti-bot interstitial did not clear");
                return;
            }
            tokio::time::sleep(Duration::from_secs(Limits::ANTI_BOT_POLL_SECS)).await;
        }
    }

    /// Best-effort network quiescence wait.
    pub async fn await_net_idle(&self, window: &dyn Window) {
        if self.config.net_idle_wait == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.config.net_idle_wait);
        match window.wait_for_net_idle(timeout).await {
            Ok(true) => {}
            Ok(false) => debug!(target: "driver", "network not idle before timeout"),
            Err(e) => debug!(target: "driver", "net-idle wait failed: {}", e),
        }
    }

    /// Invoke the injected behavior's page-loaded hook, then sleep the
    /// configured post-load delay.
    pub async fn await_custom_page_load(&self, window: &dyn Window, main_frame: &FrameInfo) {
        let op_timeout = Duration::from_secs(Limits::PAGE_OP_TIMEOUT_SECS);
        if let Err(e) =
            tokio::time::timeout(op_timeout, window.evaluate(&main_frame.id, AWAIT_PAGE_LOAD))
                .await
        {
            debug!(target: "behavior", "awaitPageLoad timed out: {}", e);
        }
        if self.config.post_load_delay > 0 {
            tokio::time::sleep(Duration::from_secs(self.config.post_load_delay)).await;
        }
    }

    /// Run injected behaviors in the main frame. Returns true when behaviors
    /// ran to completion within the behavior timeout.
    pub async fn run_behaviors(&self, window: &dyn Window, main_frame: &FrameInfo) -> bool {
        if !self.config.enable_behaviors {
            return true;
        }
        let opts = self
            .config
            .behavior_opts
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let script = format!(
            "self.__sitecap_runBehaviors ? self.__sitecap_runBehaviors({}) : true",
            opts
        );
        let timeout = Duration::from_secs(self.config.behavior_timeout);
        match tokio::time::timeout(timeout, window.evaluate(&main_frame.id, &script)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(target: "behavior", "behavior evaluation failed: {}", e);
                false
            }
            Err(_) => {
                warn!(target: "behavior", "behaviors timed out");
                false
            }
        }
    }

    /// Frames eligible for extraction: the main frame, plus IFRAME/FRAME
    /// children that have a real URL and are not ad frames.
    pub async fn filter_frames(
        &self,
        window: &dyn Window,
    ) -> Result<Vec<FrameInfo>, BrowserError> {
        let frames = window.frames().await?;
        Ok(frames
            .into_iter()
            .filter(|frame| {
                if frame.is_main {
                    return true;
                }
                let owner_ok = matches!(
                    frame.owner_tag.as_deref(),
                    Some("IFRAME") | Some("FRAME")
                );
                owner_ok && frame.url != "about:blank" && !self.is_ad_url(&frame.url)
            })
            .collect())
    }

    fn is_ad_url(&self, raw: &str) -> bool {
        if !self.config.block_ads {
            return false;
        }
        let Some(host) = Url::parse(raw).ok().and_then(|u| u.host_str().map(String::from))
        else {
            return false;
        };
        self.ad_hosts.iter().any(|re| re.is_match(&host))
    }

    /// Build the per-window interception policy.
    ///
    /// The main-document request for the page URL is always allowed. Block
    /// rules, ad blocking and origin overrides are consulted next. Of what
    /// remains, same-origin document/script/stylesheet/image requests are
    /// allowed and recorded unless their capture already exists on disk;
    /// everything else is aborted.
    fn request_policy(
        &self,
        target: Arc<Mutex<Url>>,
        resources: Arc<Mutex<Vec<String>>>,
    ) -> RequestPolicy {
        let rules: Vec<(Regex, BlockRuleType, Option<Regex>)> = self
            .block_rules
            .iter()
            .map(|r| (r.url.clone(), r.rule_type, r.in_frame_url.clone()))
            .collect();
        let ad_hosts = if self.config.block_ads {
            self.ad_hosts.clone()
        } else {
            Vec::new()
        };
        let overrides = self.origin_overrides.clone();
        let archive = Arc::clone(&self.archive);
        let recrawl = self.config.recrawl_update_data;

        Arc::new(move |request: &RequestInfo| {
            let page_url = target.lock().clone();
            if request.is_navigation && request.url == page_url.as_str() {
                return RequestDecision::Allow;
            }

            // Framework rules take precedence over the default policy.
            for (url_re, rule_type, frame_re) in &rules {
                let frame_matches = match (frame_re, &request.frame_url) {
                    (None, _) => true,
                    (Some(re), Some(frame_url)) => re.is_match(frame_url),
                    (Some(_), None) => false,
                };
                if !frame_matches {
                    continue;
                }
                let url_matches = url_re.is_match(&request.url);
                match rule_type {
                    BlockRuleType::Block if url_matches => return RequestDecision::Abort,
                    BlockRuleType::AllowOnly if !url_matches => return RequestDecision::Abort,
                    _ => {}
                }
            }
            if let Ok(url) = Url::parse(&request.url) {
                if let Some(host) = url.host_str() {
                    if ad_hosts.iter().any(|re| re.is_match(host)) {
                        return RequestDecision::Abort;
                    }
                }
                if overrides
                    .iter()
                    .any(|(from, _)| request.url.starts_with(from))
                {
                    // Rewritten elsewhere by the override rule; let it through.
                    return RequestDecision::Allow;
                }

                let same_origin = url.origin() == page_url.origin();
                let wanted_type = matches!(
                    request.resource_type,
                    ResourceType::Document
                        | ResourceType::Script
                        | ResourceType::Stylesheet
                        | ResourceType::Image
                );
                if same_origin && wanted_type {
                    if !recrawl && archive.exists(&url) {
                        return RequestDecision::Abort;
                    }
                    resources.lock().push(request.url.clone());
                    return RequestDecision::Allow;
                }
            }
            RequestDecision::Abort
        })
    }
}

pub fn is_html_mime(mime: &str) -> bool {
    let lower = mime.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockRule;
    use tempfile::TempDir;

    fn driver_with(config: CrawlConfig) -> (TempDir, PageDriver) {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(Archive::new(dir.path(), false));
        let driver = PageDriver::new(Arc::new(config), archive).unwrap();
        (dir, driver)
    }

    fn request(url: &str, resource_type: ResourceType, is_navigation: bool) -> RequestInfo {
        RequestInfo {
            url: url.to_string(),
            resource_type,
            frame_url: None,
            is_navigation,
        }
    }

    fn target(url: &str) -> Arc<Mutex<Url>> {
        Arc::new(Mutex::new(Url::parse(url).unwrap()))
    }

    #[test]
    fn test_main_document_always_allowed() {
        let (_dir, driver) = driver_with(CrawlConfig::default());
        let policy = driver.request_policy(
            target("https://example.com/page"),
            Arc::new(Mutex::new(Vec::new())),
        );
        let decision = policy(&request(
            "https://example.com/page",
            ResourceType::Document,
            true,
        ));
        assert_eq!(decision, RequestDecision::Allow);
    }

    #[test]
    fn test_same_origin_subresources_allowed_and_recorded() {
        let (_dir, driver) = driver_with(CrawlConfig::default());
        let resources = Arc::new(Mutex::new(Vec::new()));
        let policy =
            driver.request_policy(target("https://example.com/page"), Arc::clone(&resources));

        assert_eq!(
            policy(&request(
                "https://example.com/style.css",
                ResourceType::Stylesheet,
                false
            )),
            RequestDecision::Allow
        );
        assert_eq!(
            policy(&request(
                "https://example.com/app.js",
                ResourceType::Script,
                false
            )),
            RequestDecision::Allow
        );
        // Cross-origin and non-capture types are aborted.
        assert_eq!(
            policy(&request(
                "https://cdn.example.net/lib.js",
                ResourceType::Script,
                false
            )),
            RequestDecision::Abort
        );
        assert_eq!(
            policy(&request(
                "https://example.com/api/data",
                ResourceType::Xhr,
                false
            )),
            RequestDecision::Abort
        );
        assert_eq!(resources.lock().len(), 2);
    }

    #[test]
    fn test_existing_capture_aborts_subresource() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(Archive::new(dir.path(), false));
        let url = Url::parse("https://example.com/style.css").unwrap();
        let path = archive.path_for(&url).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"body{}").unwrap();

        let driver = PageDriver::new(Arc::new(CrawlConfig::default()), archive).unwrap();
        let policy = driver.request_policy(
            target("https://example.com/page"),
            Arc::new(Mutex::new(Vec::new())),
        );
        assert_eq!(
            policy(&request(
                "https://example.com/style.css",
                ResourceType::Stylesheet,
                false
            )),
            RequestDecision::Abort
        );
    }

    #[test]
    fn test_block_rules_take_precedence() {
        let (_dir, driver) = driver_with(CrawlConfig {
            block_rules: vec![BlockRule {
                url: "tracker\\.js".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let policy = driver.request_policy(
            target("https://example.com/page"),
            Arc::new(Mutex::new(Vec::new())),
        );
        assert_eq!(
            policy(&request(
                "https://example.com/tracker.js",
                ResourceType::Script,
                false
            )),
            RequestDecision::Abort
        );
    }

    #[test]
    fn test_ad_hosts_blocked_when_enabled() {
        let (_dir, driver) = driver_with(CrawlConfig {
            block_ads: true,
            ..Default::default()
        });
        let policy = driver.request_policy(
            target("https://example.com/page"),
            Arc::new(Mutex::new(Vec::new())),
        );
        assert_eq!(
            policy(&request(
                "https://ads.doubleclick.net/pixel",
                ResourceType::Image,
                false
            )),
            RequestDecision::Abort
        );
    }

    #[test]
    fn test_is_html_mime() {
        assert!(is_html_mime("text/html"));
        assert!(is_html_mime("text/html; charset=utf-8"));
        assert!(is_html_mime("application/xhtml+xml"));
        assert!(!is_html_mime("application/pdf"));
        assert!(!is_html_mime("image/png"));
    }
}
