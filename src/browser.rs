//! Browser client contract.
//!
//! The crawl core drives windows through these traits; the actual automation
//! library lives behind them. The `browser` cargo feature provides a CDP-based
//! implementation (`chrome` module); tests drive scripted implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::WaitUntil;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("window closed")]
    WindowClosed,
    #[error("window crashed")]
    Crashed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Navigation failure, classified for outcome mapping.
#[derive(Error, Debug)]
pub enum NavError {
    /// Navigation deadline elapsed. `content_loaded` is true when the DOM
    /// content event fired before the timeout.
    #[error("navigation timed out (content_loaded={content_loaded})")]
    Timeout { content_loaded: bool },
    /// Navigation aborted by the browser (`net::ERR_ABORTED`); carries the
    /// response content type when one was seen (document downloads).
    #[error("navigation aborted (mime={mime:?})")]
    Aborted { mime: Option<String> },
    /// No response at all.
    #[error("no response: {0}")]
    NoResponse(String),
    #[error("window crashed")]
    Crashed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The response a completed navigation settled on: the first non-redirect
/// response, upgraded to the fully-loaded response when available.
#[derive(Debug, Clone)]
pub struct NavResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub mime: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GotoOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

pub type FrameId = String;

/// One document context inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub url: String,
    pub is_main: bool,
    /// Tag name of the embedding element (`IFRAME`, `FRAME`, ...), when any.
    pub owner_tag: Option<String>,
}

/// Request resource classification, as reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Xhr,
    Fetch,
    Websocket,
    Other,
}

/// One intercepted request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub url: String,
    pub resource_type: ResourceType,
    /// URL of the frame the request was issued from, when known.
    pub frame_url: Option<String>,
    /// True for the top-level document request.
    pub is_navigation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Allow,
    Abort,
}

/// Interception policy installed once per window.
pub type RequestPolicy = Arc<dyn Fn(&RequestInfo) -> RequestDecision + Send + Sync>;

/// Launch-time options for the shared browser process.
#[derive(Debug, Clone, Default)]
pub struct BrowserLaunchOpts {
    pub headless: bool,
    pub profile: Option<std::path::PathBuf>,
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    pub mobile_device: Option<String>,
}

impl BrowserLaunchOpts {
    /// Assemble the effective user agent: explicit override, otherwise the
    /// browser default plus an optional suffix.
    pub fn effective_user_agent(&self, browser_default: &str, suffix: Option<&str>) -> String {
        let base = self
            .user_agent
            .clone()
            .unwrap_or_else(|| browser_default.to_string());
        match suffix {
            Some(suffix) if !suffix.is_empty() => format!("{} {}", base, suffix),
            _ => base,
        }
    }
}

/// The shared browser process; windows are handed to one worker at a time.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_window(&self) -> Result<Box<dyn Window>, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A single browser window. Never driven from two workers concurrently.
#[async_trait]
pub trait Window: Send + Sync {
    async fn navigate(&self, url: &str, opts: &GotoOptions) -> Result<NavResponse, NavError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// All frames currently attached to the window, main frame first.
    async fn frames(&self) -> Result<Vec<FrameInfo>, BrowserError>;

    /// Evaluate a script in a frame, returning its JSON result.
    async fn evaluate(&self, frame: &FrameId, script: &str) -> Result<Value, BrowserError>;

    /// Collect `attribute` (or DOM property) values from every element
    /// matching `selector` in the frame. Values are returned verbatim;
    /// relative URLs are resolved by the caller against the frame URL.
    async fn extract_attributes(
        &self,
        frame: &FrameId,
        selector: &str,
        attribute: &str,
        is_attribute: bool,
    ) -> Result<Vec<String>, BrowserError>;

    /// Script evaluated in every new document before page scripts run.
    async fn add_init_script(&self, script: &str) -> Result<(), BrowserError>;

    /// Expose a host callback; page scripts call `name(arg)` and each string
    /// argument is delivered on the sink.
    async fn expose_callback(
        &self,
        name: &str,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), BrowserError>;

    /// Install the request-interception policy (once per window).
    async fn set_request_policy(&self, policy: RequestPolicy) -> Result<(), BrowserError>;

    /// Extra headers applied to subsequent navigations (basic auth, language).
    async fn set_extra_headers(&self, headers: Vec<(String, String)>)
        -> Result<(), BrowserError>;

    /// Best-effort wait for network quiescence; returns whether the network
    /// went idle before the timeout.
    async fn wait_for_net_idle(&self, timeout: Duration) -> Result<bool, BrowserError>;

    /// True once the window has reported a crash.
    fn crashed(&self) -> bool;

    async fn close(&self) -> Result<(), BrowserError>;
}
