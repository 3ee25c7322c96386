//! Transcript discovery
//!
//! Helpers for locating an agent's project directory and its transcripts,
//! plus the [`ProjectScanner`] that notices transcripts appearing there.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, trace};

pub(crate) fn is_jsonl(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
}

/// Directory name the agent CLI uses for a workspace path.
pub fn project_slug(workspace: &Path) -> String {
    workspace
        .to_string_lossy()
        .chars()
        .map(|c| if matches!(c, ':' | '\\' | '/') { '-' } else { c })
        .collect()
}

/// `~/.claude/projects/<slug>` for `workspace`.
pub fn project_dir_for(workspace: &Path) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(
        home.join(".claude")
            .join("projects")
            .join(project_slug(workspace)),
    )
}

/// Transcripts directly inside `dir`, sorted. Unreadable directories yield nothing.
pub async fn list_transcripts(dir: &Path) -> Vec<PathBuf> {
    let Ok(mut rd) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };

    let mut out = Vec::new();
    while let Ok(Some(entry)) = rd.next_entry().await {
        let path = entry.path();
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_file() && is_jsonl(&path) {
            out.push(path);
        }
    }
    out.sort();
    out
}

/// Most recently modified non-empty transcript in `dir`.
pub async fn latest_session(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for path in list_transcripts(dir).await {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if meta.len() == 0 {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        match &best {
            Some((best_time, _)) if modified <= *best_time => {}
            _ => best = Some((modified, path)),
        }
    }
    best.map(|(_, path)| path)
}

/// Transcript paths already accounted for, shared by every scanner and agent.
#[derive(Debug, Clone, Default)]
pub struct KnownFiles {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl KnownFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `path` was not known before.
    pub fn insert(&self, path: PathBuf) -> bool {
        self.inner
            .lock()
            .map(|mut set| set.insert(path))
            .unwrap_or(false)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy, for persistence.
    pub fn to_vec(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .inner
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

/// Detects transcripts created in one project directory.
#[derive(Debug, Clone)]
pub struct ProjectScanner {
    dir: PathBuf,
    known: KnownFiles,
}

impl ProjectScanner {
    pub fn new(dir: impl Into<PathBuf>, known: KnownFiles) -> Self {
        Self {
            dir: dir.into(),
            known,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mark every transcript already present as known. Returns how many were added.
    pub async fn seed(&self) -> usize {
        let added = list_transcripts(&self.dir)
            .await
            .into_iter()
            .filter(|p| self.known.insert(p.clone()))
            .count();
        debug!(dir = %self.dir.display(), added, "project scan seeded");
        added
    }

    /// Transcripts that appeared since the last seed or scan, in path order.
    pub async fn scan(&self) -> Vec<PathBuf> {
        let fresh: Vec<PathBuf> = list_transcripts(&self.dir)
            .await
            .into_iter()
            .filter(|p| self.known.insert(p.clone()))
            .collect();
        if !fresh.is_empty() {
            trace!(dir = %self.dir.display(), count = fresh.len(), "new transcripts");
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    // ==================== paths ====================

    #[test]
    fn slug_replaces_separators() {
        assert_eq!(
            project_slug(Path::new("/home/dev/my-app")),
            "-home-dev-my-app"
        );
        assert_eq!(
            project_slug(Path::new("C:\\Users\\dev\\app")),
            "C--Users-dev-app"
        );
    }

    #[test]
    fn project_dir_is_under_home() {
        let dir = project_dir_for(Path::new("/work/repo")).unwrap();
        assert!(dir.ends_with(".claude/projects/-work-repo"));
    }

    #[test]
    fn jsonl_extension_check() {
        assert!(is_jsonl(Path::new("/a/b.jsonl")));
        assert!(is_jsonl(Path::new("b.JSONL")));
        assert!(!is_jsonl(Path::new("b.json")));
        assert!(!is_jsonl(Path::new("jsonl")));
    }

    // ==================== discovery ====================

    #[tokio::test]
    async fn latest_session_by_mtime_skips_empty() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.jsonl");
        let new = dir.path().join("new.jsonl");
        let empty = dir.path().join("empty.jsonl");
        std::fs::write(&old, "{}\n").unwrap();
        std::fs::write(&new, "{}\n").unwrap();
        std::fs::write(&empty, "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&new, FileTime::from_unix_time(2_000, 0)).unwrap();
        set_file_mtime(&empty, FileTime::from_unix_time(3_000, 0)).unwrap();

        assert_eq!(latest_session(dir.path()).await, Some(new));
    }

    #[tokio::test]
    async fn latest_session_in_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(latest_session(&dir.path().join("nope")).await, None);
    }

    // ==================== ProjectScanner ====================

    #[tokio::test]
    async fn scan_reports_only_new_transcripts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "").unwrap();

        let known = KnownFiles::new();
        let scanner = ProjectScanner::new(dir.path(), known.clone());
        assert_eq!(scanner.seed().await, 1);
        assert!(scanner.scan().await.is_empty());

        let b = dir.path().join("b.jsonl");
        std::fs::write(&b, "").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();
        assert_eq!(scanner.scan().await, vec![b.clone()]);
        assert!(scanner.scan().await.is_empty());
        assert!(known.contains(&b));
    }

    #[tokio::test]
    async fn known_files_are_shared_between_scanners() {
        let dir = TempDir::new().unwrap();
        let expected = dir.path().join("session.jsonl");
        let known = KnownFiles::new();
        assert!(known.insert(expected.clone()));

        let scanner = ProjectScanner::new(dir.path(), known.clone());
        std::fs::write(&expected, "").unwrap();
        assert!(scanner.scan().await.is_empty());
        assert_eq!(known.len(), 1);
        assert_eq!(known.to_vec(), vec![expected]);
    }
}
