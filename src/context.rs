//! Shared crawl context: the cancellation token plus the handful of flags the
//! signal handler and control channel flip. Passed explicitly to every
//! component; there is no process-global crawl state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scope::ScopeEngine;
use crate::store::{ControlCommand, CrawlStatus, CrawlStore, StoreError};

#[derive(Default)]
pub struct CrawlContext {
    /// Hard-stop signal; every suspension point observes it.
    pub cancel: CancellationToken,
    graceful: AtomicBool,
    paused: AtomicBool,
    force_armed: AtomicBool,
    browser_crashed: AtomicBool,
    serializing: AtomicBool,
    interrupted_during_serialize: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl CrawlContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Finish the page in hand, then stop.
    pub fn request_graceful_stop(&self) {
        self.graceful.store(true, Ordering::Relaxed);
    }

    pub fn graceful_requested(&self) -> bool {
        self.graceful.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// SIGABRT arms force-terminate for the next signal.
    pub fn arm_force(&self) {
        self.force_armed.store(true, Ordering::Relaxed);
    }

    pub fn force_armed(&self) -> bool {
        self.force_armed.load(Ordering::Relaxed)
    }

    pub fn set_browser_crashed(&self) {
        self.browser_crashed.store(true, Ordering::Relaxed);
    }

    pub fn browser_crashed(&self) -> bool {
        self.browser_crashed.load(Ordering::Relaxed)
    }

    /// Bracket checkpoint writes so an interrupt there is distinguishable.
    pub fn set_serializing(&self, active: bool) {
        self.serializing.store(active, Ordering::Relaxed);
    }

    pub fn is_serializing(&self) -> bool {
        self.serializing.load(Ordering::Relaxed)
    }

    pub fn mark_interrupted_during_serialize(&self) {
        self.interrupted_during_serialize
            .store(true, Ordering::Relaxed);
    }

    pub fn interrupted_during_serialize(&self) -> bool {
        self.interrupted_during_serialize.load(Ordering::Relaxed)
    }

    /// First fatal error wins; later ones are logged by their reporters.
    pub fn set_fatal(&self, reason: impl Into<String>) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(reason.into());
        }
    }

    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Drain and apply operator commands from the store's control channel.
    pub async fn drain_control_messages(
        &self,
        store: &CrawlStore,
        scope: &ScopeEngine,
    ) -> Result<(), StoreError> {
        while let Some(command) = store.next_control_message().await? {
            info!(target: "crawlStatus", "control message: {:?}", command);
            match command {
                ControlCommand::AddExclusion(pattern) => {
                    if let Err(e) = scope.add_exclusion(&pattern) {
                        warn!(target: "crawlStatus", "bad exclusion {:?}: {}", pattern, e);
                    }
                }
                ControlCommand::RemoveExclusion(pattern) => {
                    scope.remove_exclusion(&pattern);
                }
                ControlCommand::Cancel => {
                    store.set_status(CrawlStatus::Canceled).await?;
                    self.cancel.cancel();
                }
                ControlCommand::Pause => self.set_paused(true),
                ControlCommand::Resume => self.set_paused(false),
                ControlCommand::StopGracefully => self.request_graceful_stop(),
            }
        }
        Ok(())
    }
}
