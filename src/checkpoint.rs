//! Crawl checkpoints: YAML files carrying the original config plus the full
//! store snapshot, written atomically (tmp + rename) and rotated.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CrawlConfig;
use crate::store::StateSnapshot;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Content of one checkpoint file.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub config: CrawlConfig,
    pub state: StateSnapshot,
}

pub struct Checkpointer {
    dir: PathBuf,
    crawl_id: String,
    history: usize,
    seq: std::sync::atomic::AtomicU64,
}

impl Checkpointer {
    pub fn new(collection_dir: &Path, crawl_id: impl Into<String>, history: usize) -> Self {
        Self {
            dir: collection_dir.join("collections"),
            crawl_id: crawl_id.into(),
            history: history.max(1),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Stamp plus a write sequence, so rapid checkpoints stay distinct and
    /// lexicographic order remains chronological.
    fn file_name(&self) -> String {
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!(
            "crawl-{}.{:04}-{}.yaml",
            Utc::now().format("%Y%m%d%H%M%S"),
            seq,
            self.crawl_id
        )
    }

    fn is_own_checkpoint(&self, name: &str) -> bool {
        name.starts_with("crawl-") && name.ends_with(&format!("-{}.yaml", self.crawl_id))
    }

    /// All checkpoint files for this crawl, oldest first. The UTC stamp in
    /// the name makes lexicographic order chronological.
    fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| self.is_own_checkpoint(n))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    /// Write a checkpoint and drop files beyond the history limit.
    pub fn write(
        &self,
        config: &CrawlConfig,
        state: &StateSnapshot,
    ) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;
        let path = self.dir.join(self.file_name());
        let tmp = path.with_extension("yaml.tmp");
        let file = CheckpointFile {
            config: config.clone(),
            state: state.clone(),
        };
        let yaml = serde_yaml::to_string(&file)?;
        fs::write(&tmp, yaml).map_err(|source| CheckpointError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let files = self.list();
        if files.len() > self.history {
            for stale in &files[..files.len() - self.history] {
                debug!(target: "state", "rotating out checkpoint {}", stale.display());
                let _ = fs::remove_file(stale);
            }
        }
        info!(target: "state", "checkpoint written: {}", path.display());
        Ok(path)
    }

    /// Most recent checkpoint, if any.
    pub fn latest(&self) -> Result<Option<CheckpointFile>, CheckpointError> {
        let Some(path) = self.list().into_iter().next_back() else {
            return Ok(None);
        };
        let text = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: CheckpointFile = serde_yaml::from_str(&text)?;
        info!(target: "state", "loaded checkpoint {}", path.display());
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QueueEntry;
    use tempfile::TempDir;

    fn snapshot_with(urls: &[&str]) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for url in urls {
            snapshot
                .queued
                .entry(0)
                .or_default()
                .push(QueueEntry::new(*url, 0, 0, 0));
            snapshot.seen.push(url.to_string());
        }
        snapshot
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "crawl-x", 3);
        let config = CrawlConfig {
            page_limit: 42,
            ..Default::default()
        };
        let snapshot = snapshot_with(&["https://s/a", "https://s/b"]);

        checkpointer.write(&config, &snapshot).unwrap();
        let loaded = checkpointer.latest().unwrap().unwrap();
        assert_eq!(loaded.config.page_limit, 42);
        assert_eq!(loaded.state.queued_count(), 2);
        assert_eq!(loaded.state.seen.len(), 2);
    }

    #[test]
    fn test_rotation_keeps_history() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "crawl-x", 2);
        for i in 0..5 {
            let snapshot = snapshot_with(&[&format!("https://s/{i}")]);
            checkpointer.write(&CrawlConfig::default(), &snapshot).unwrap();
        }
        let files = checkpointer.list();
        assert_eq!(files.len(), 2);
        // Latest carries the last write.
        let loaded = checkpointer.latest().unwrap().unwrap();
        assert_eq!(loaded.state.seen, vec!["https://s/4".to_string()]);
    }

    #[test]
    fn test_latest_none_when_empty() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "crawl-x", 3);
        assert!(checkpointer.latest().unwrap().is_none());
    }

    #[test]
    fn test_other_crawls_ignored() {
        let dir = TempDir::new().unwrap();
        let a = Checkpointer::new(dir.path(), "crawl-a", 3);
        let b = Checkpointer::new(dir.path(), "crawl-b", 3);
        a.write(&CrawlConfig::default(), &snapshot_with(&["https://a/"]))
            .unwrap();
        assert!(b.latest().unwrap().is_none());
    }
}
