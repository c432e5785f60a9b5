//! On-disk archive layout and size accounting.
//!
//! Captured resources are mirrored by URL path under
//! `<collection>/archive/<host>/<pathname-or-index.html>`. The writer itself
//! is external; the crawl core only needs the path mapping (for the
//! request-interception disk check), the total size (for `sizeLimit`), and
//! the filesystem utilization probe (for `diskUtilization`).

use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use url::Url;

pub struct Archive {
    root: PathBuf,
    dry_run: bool,
}

impl Archive {
    pub fn new(collection_dir: &Path, dry_run: bool) -> Self {
        Self {
            root: collection_dir.join("archive"),
            dry_run,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Mirror path for a URL: `<host>/<path>`, with `index.html` substituted
    /// for directory paths. Query strings are not part of the layout.
    pub fn path_for(&self, url: &Url) -> Option<PathBuf> {
        let host = url.host_str()?;
        let mut path = self.root.join(host);
        let url_path = url.path().trim_start_matches('/');
        if url_path.is_empty() {
            path.push("index.html");
        } else {
            for part in url_path.split('/') {
                if !part.is_empty() {
                    path.push(part);
                }
            }
            if url.path().ends_with('/') {
                path.push("index.html");
            }
        }
        Some(path)
    }

    /// Whether a capture for this URL already exists on disk.
    pub fn exists(&self, url: &Url) -> bool {
        self.path_for(url).map(|p| p.is_file()).unwrap_or(false)
    }

    /// A write is needed unless the file exists (idempotent per-URL writes)
    /// or this is a dry run.
    pub fn should_write_file(&self, url: &Url) -> bool {
        !self.dry_run && !self.exists(url)
    }

    /// Total bytes under the archive root.
    pub fn measure_size(&self) -> u64 {
        dir_size(&self.root)
    }

    /// Percent utilization of the filesystem holding the archive, via `df`.
    pub async fn disk_utilization(&self) -> io::Result<u32> {
        let probe = existing_ancestor(&self.root);
        let output = Command::new("df").arg("-P").arg(&probe).output().await?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::Other, "df failed"));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_df_use_percent(&text)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unparseable df output"))
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if parent != Path::new("") => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

fn parse_df_use_percent(output: &str) -> Option<u32> {
    // POSIX format: Filesystem 1024-blocks Used Available Capacity Mounted on
    let line = output.lines().nth(1)?;
    let capacity = line.split_whitespace().nth(4)?;
    capacity.trim_end_matches('%').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive() -> (TempDir, Archive) {
        let dir = TempDir::new().unwrap();
        let archive = Archive::new(dir.path(), false);
        (dir, archive)
    }

    #[test]
    fn test_path_mapping() {
        let (_dir, archive) = archive();
        let url = Url::parse("https://example.com/docs/page.html").unwrap();
        let path = archive.path_for(&url).unwrap();
        assert!(path.ends_with("example.com/docs/page.html"));
    }

    #[test]
    fn test_directory_paths_get_index_html() {
        let (_dir, archive) = archive();
        let root = Url::parse("https://example.com/").unwrap();
        assert!(archive.path_for(&root).unwrap().ends_with("example.com/index.html"));
        let dir_url = Url::parse("https://example.com/docs/").unwrap();
        assert!(archive
            .path_for(&dir_url)
            .unwrap()
            .ends_with("example.com/docs/index.html"));
    }

    #[test]
    fn test_exists_and_should_write() {
        let (_dir, archive) = archive();
        let url = Url::parse("https://example.com/a.html").unwrap();
        assert!(!archive.exists(&url));
        assert!(archive.should_write_file(&url));

        let path = archive.path_for(&url).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"captured").unwrap();
        assert!(archive.exists(&url));
        assert!(!archive.should_write_file(&url));
    }

    #[test]
    fn test_dry_run_never_writes() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::new(dir.path(), true);
        let url = Url::parse("https://example.com/a.html").unwrap();
        assert!(!archive.should_write_file(&url));
    }

    #[test]
    fn test_measure_size() {
        let (_dir, archive) = archive();
        assert_eq!(archive.measure_size(), 0);
        let url = Url::parse("https://example.com/data.bin").unwrap();
        let path = archive.path_for(&url).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        assert_eq!(archive.measure_size(), 1024);
    }

    #[test]
    fn test_parse_df_output() {
        let out = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                   /dev/sda1   10000000  4200000 5800000      42% /\n";
        assert_eq!(parse_df_use_percent(out), Some(42));
    }
}
