//! CDP-backed implementation of the browser client contract, available with
//! the `browser` cargo feature.
//!
//! One shared Chromium process; each [`Window`] wraps a page (tab) with its
//! own event listeners for responses, request interception, host-callback
//! bindings, and crash reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventResponseReceived, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::GetFrameTreeParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::Page;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::browser::{
    Browser, BrowserError, BrowserLaunchOpts, FrameId, FrameInfo, GotoOptions, NavError,
    NavResponse, RequestDecision, RequestInfo, RequestPolicy, ResourceType, Window,
};

fn protocol_error(e: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(e.to_string())
}

pub struct ChromeBrowser {
    browser: tokio::sync::Mutex<CdpBrowser>,
}

impl ChromeBrowser {
    /// Launch a shared Chromium. `GEOMETRY` (WxH) sets the window size.
    pub async fn launch(opts: &BrowserLaunchOpts) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if !opts.headless {
            builder = builder.with_head();
        }
        if let Some(profile) = &opts.profile {
            builder = builder.user_data_dir(profile);
        }
        if let Some(agent) = &opts.user_agent {
            builder = builder.arg(format!("--user-agent={}", agent));
        }
        if let Some(lang) = &opts.lang {
            builder = builder.arg(format!("--lang={}", lang));
        }
        if let Ok(geometry) = std::env::var("GEOMETRY") {
            if let Some((w, h)) = geometry.split_once('x') {
                builder = builder.arg(format!("--window-size={},{}", w, h));
            }
        }
        let config = builder
            .build()
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let (browser, mut handler) = CdpBrowser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });
        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
        })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_window(&self) -> Result<Box<dyn Window>, BrowserError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(protocol_error)?;

        let crashed = Arc::new(AtomicBool::new(false));
        let crash_flag = Arc::clone(&crashed);
        let mut crash_events = page
            .event_listener::<EventTargetCrashed>()
            .await
            .map_err(protocol_error)?;
        tokio::spawn(async move {
            if crash_events.next().await.is_some() {
                crash_flag.store(true, Ordering::Relaxed);
            }
        });

        Ok(Box::new(ChromeWindow {
            page,
            crashed,
            last_response: Arc::new(Mutex::new(None)),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.browser
            .lock()
            .await
            .close()
            .await
            .map_err(protocol_error)?;
        Ok(())
    }
}

struct ChromeWindow {
    page: Page,
    crashed: Arc<AtomicBool>,
    last_response: Arc<Mutex<Option<NavResponse>>>,
}

impl ChromeWindow {
    /// Watch responses during a navigation and keep the strongest
    /// main-document candidate: the first non-redirect document response.
    async fn spawn_response_watcher(&self) -> Result<(), BrowserError> {
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(protocol_error)?;
        let slot = Arc::clone(&self.last_response);
        tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let status = event.response.status as u16;
                if (300..400).contains(&status) {
                    continue;
                }
                let is_document = matches!(
                    event.r#type,
                    chromiumoxide::cdp::browser_protocol::network::ResourceType::Document
                );
                if !is_document {
                    continue;
                }
                let mut slot = slot.lock();
                if slot.is_none() {
                    *slot = Some(NavResponse {
                        url: event.response.url.clone(),
                        status,
                        mime: Some(event.response.mime_type.clone()),
                    });
                }
            }
        });
        Ok(())
    }
}

fn map_resource_type(
    raw: &chromiumoxide::cdp::browser_protocol::network::ResourceType,
) -> ResourceType {
    use chromiumoxide::cdp::browser_protocol::network::ResourceType as Cdp;
    match raw {
        Cdp::Document => ResourceType::Document,
        Cdp::Script => ResourceType::Script,
        Cdp::Stylesheet => ResourceType::Stylesheet,
        Cdp::Image => ResourceType::Image,
        Cdp::Font => ResourceType::Font,
        Cdp::Media => ResourceType::Media,
        Cdp::Xhr => ResourceType::Xhr,
        Cdp::Fetch => ResourceType::Fetch,
        Cdp::WebSocket => ResourceType::Websocket,
        _ => ResourceType::Other,
    }
}

#[async_trait]
impl Window for ChromeWindow {
    async fn navigate(&self, url: &str, opts: &GotoOptions) -> Result<NavResponse, NavError> {
        if self.crashed() {
            return Err(NavError::Crashed);
        }
        self.last_response.lock().take();
        self.spawn_response_watcher()
            .await
            .map_err(|e| NavError::Protocol(e.to_string()))?;

        let goto = self.page.goto(url.to_string());
        match tokio::time::timeout(opts.timeout, goto).await {
            Ok(Ok(_)) => {
                let response =
                    self.last_response
                        .lock()
                        .clone()
                        .unwrap_or_else(|| NavResponse {
                            url: url.to_string(),
                            status: 200,
                            mime: Some("text/html".to_string()),
                        });
                Ok(response)
            }
            Ok(Err(e)) => {
                if self.crashed() {
                    return Err(NavError::Crashed);
                }
                let message = e.to_string();
                if message.contains("net::ERR_ABORTED") {
                    let mime = self.last_response.lock().clone().and_then(|r| r.mime);
                    Err(NavError::Aborted { mime })
                } else {
                    Err(NavError::NoResponse(message))
                }
            }
            Err(_) => {
                let content_loaded = self
                    .page
                    .evaluate("document.readyState !== 'loading'")
                    .await
                    .ok()
                    .and_then(|result| result.into_value::<bool>().ok())
                    .unwrap_or(false);
                Err(NavError::Timeout { content_loaded })
            }
        }
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let url = self.page.url().await.map_err(protocol_error)?;
        Ok(url.map(|u| u.to_string()).unwrap_or_default())
    }

    async fn frames(&self) -> Result<Vec<FrameInfo>, BrowserError> {
        let tree = self
            .page
            .execute(GetFrameTreeParams::default())
            .await
            .map_err(protocol_error)?;
        let mut frames = Vec::new();
        let root = &tree.result.frame_tree;
        frames.push(FrameInfo {
            id: root.frame.id.inner().to_string(),
            url: root.frame.url.clone(),
            is_main: true,
            owner_tag: None,
        });
        if let Some(children) = &root.child_frames {
            let mut stack: Vec<_> = children.iter().collect();
            while let Some(node) = stack.pop() {
                frames.push(FrameInfo {
                    id: node.frame.id.inner().to_string(),
                    url: node.frame.url.clone(),
                    // The frame tree does not carry the owner element; CDP
                    // child frames come from iframe/frame embeds.
                    is_main: false,
                    owner_tag: Some("IFRAME".to_string()),
                });
                if let Some(grandchildren) = &node.child_frames {
                    stack.extend(grandchildren.iter());
                }
            }
        }
        Ok(frames)
    }

    async fn evaluate(&self, _frame: &FrameId, script: &str) -> Result<Value, BrowserError> {
        // Evaluation runs in the main world; same-process subframes are
        // reachable from there, cross-origin ones are not.
        let result = self
            .page
            .evaluate(script.to_string())
            .await
            .map_err(protocol_error)?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn extract_attributes(
        &self,
        frame: &FrameId,
        selector: &str,
        attribute: &str,
        is_attribute: bool,
    ) -> Result<Vec<String>, BrowserError> {
        let accessor = if is_attribute {
            format!("e.getAttribute({})", serde_json::to_string(attribute).unwrap_or_default())
        } else {
            format!("e[{}]", serde_json::to_string(attribute).unwrap_or_default())
        };
        let script = format!(
            "Array.from(document.querySelectorAll({sel})).map(e => {acc})\
             .filter(v => typeof v === 'string' && v.length > 0)",
            sel = serde_json::to_string(selector).unwrap_or_default(),
            acc = accessor,
        );
        let value = self.evaluate(frame, &script).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn add_init_script(&self, script: &str) -> Result<(), BrowserError> {
        self.page
            .evaluate_on_new_document(script.to_string())
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn expose_callback(
        &self,
        name: &str,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), BrowserError> {
        self.page
            .execute(AddBindingParams::new(name.to_string()))
            .await
            .map_err(protocol_error)?;
        let mut calls = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(protocol_error)?;
        let bound_name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = calls.next().await {
                if event.name == bound_name && sink.send(event.payload.clone()).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn set_request_policy(&self, policy: RequestPolicy) -> Result<(), BrowserError> {
        self.page
            .execute(FetchEnableParams::default())
            .await
            .map_err(protocol_error)?;
        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(protocol_error)?;
        let page = self.page.clone();
        tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let info = RequestInfo {
                    url: event.request.url.clone(),
                    resource_type: map_resource_type(&event.resource_type),
                    frame_url: None,
                    is_navigation: matches!(
                        event.resource_type,
                        chromiumoxide::cdp::browser_protocol::network::ResourceType::Document
                    ),
                };
                let command = match policy(&info) {
                    RequestDecision::Allow => page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    RequestDecision::Abort => page
                        .execute(
                            FailRequestParams::new(
                                event.request_id.clone(),
                                ErrorReason::Aborted,
                            ),
                        )
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                };
                if let Err(e) = command {
                    debug!(target: "driver", "interception response failed: {}", e);
                }
            }
        });
        Ok(())
    }

    async fn set_extra_headers(
        &self,
        headers: Vec<(String, String)>,
    ) -> Result<(), BrowserError> {
        let mut map = serde_json::Map::new();
        for (name, value) in headers {
            map.insert(name, Value::String(value));
        }
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(Value::Object(
                map,
            ))))
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn wait_for_net_idle(&self, timeout: Duration) -> Result<bool, BrowserError> {
        match tokio::time::timeout(timeout, self.page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                warn!(target: "driver", "wait_for_navigation failed: {}", e);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    fn crashed(&self) -> bool {
        self.crashed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.page.clone().close().await.map_err(protocol_error)?;
        Ok(())
    }
}
