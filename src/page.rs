//! The transient record a worker carries while processing one URL.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::browser::FrameInfo;
use crate::store::QueueEntry;

/// Page lifecycle, ordered: a page is finished successfully once it reaches
/// `FullPageLoaded` or beyond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    #[default]
    None,
    ContentLoaded,
    FullPageLoaded,
    ExtractionDone,
    BehaviorsDone,
}

/// Per-page working state, created at claim time and discarded at page end.
#[derive(Debug)]
pub struct PageState {
    pub entry: QueueEntry,
    pub page_id: String,
    pub load_state: LoadState,
    pub status: u16,
    pub mime: Option<String>,
    pub is_html_page: bool,
    pub title: Option<String>,
    pub filtered_frames: Vec<FrameInfo>,
    /// Same-origin resources allowed through interception for this page.
    pub resources: Vec<String>,
    /// Free-form details attached to the page's log records.
    pub log_details: Map<String, Value>,
    /// Full load timed out but DOM content arrived; behaviors are skipped.
    pub slow_page: bool,
}

impl PageState {
    pub fn new(mut entry: QueueEntry) -> Self {
        let page_id = entry
            .page_id
            .take()
            .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
        Self {
            entry,
            page_id,
            load_state: LoadState::None,
            status: 0,
            mime: None,
            is_html_page: false,
            title: None,
            filtered_frames: Vec::new(),
            resources: Vec::new(),
            log_details: Map::new(),
            slow_page: false,
        }
    }

    /// Promote the load state; never regresses.
    pub fn advance(&mut self, state: LoadState) {
        if state > self.load_state {
            self.load_state = state;
        }
    }

    pub fn is_finished_successfully(&self) -> bool {
        self.load_state >= LoadState::FullPageLoaded
    }

    pub fn add_detail(&mut self, key: &str, value: impl Into<Value>) {
        self.log_details.insert(key.to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_ordering() {
        assert!(LoadState::None < LoadState::ContentLoaded);
        assert!(LoadState::ContentLoaded < LoadState::FullPageLoaded);
        assert!(LoadState::FullPageLoaded < LoadState::ExtractionDone);
        assert!(LoadState::ExtractionDone < LoadState::BehaviorsDone);
    }

    #[test]
    fn test_advance_never_regresses() {
        let mut page = PageState::new(QueueEntry::new("https://s/", 0, 0, 0));
        page.advance(LoadState::ExtractionDone);
        page.advance(LoadState::ContentLoaded);
        assert_eq!(page.load_state, LoadState::ExtractionDone);
    }

    #[test]
    fn test_finished_threshold() {
        let mut page = PageState::new(QueueEntry::new("https://s/", 0, 0, 0));
        assert!(!page.is_finished_successfully());
        page.advance(LoadState::ContentLoaded);
        assert!(!page.is_finished_successfully());
        page.advance(LoadState::FullPageLoaded);
        assert!(page.is_finished_successfully());
    }

    #[test]
    fn test_page_id_kept_from_entry() {
        let mut entry = QueueEntry::new("https://s/", 0, 0, 0);
        entry.page_id = Some("abc123".into());
        let page = PageState::new(entry);
        assert_eq!(page.page_id, "abc123");
    }
}
