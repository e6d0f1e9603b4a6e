//! Filesystem watcher.
//!
//! [`FsWatcher::next`] suspends until a qualifying path changes or the token
//! is cancelled. Once the backend stream closes the watcher stays closed.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WatchError;

type PathFilter = Box<dyn Fn(&Path) -> bool + Send + Sync>;

struct Root {
    path: PathBuf,
    is_dir: bool,
}

/// Watches a set of files and directories.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    roots: Vec<Root>,
    filter: PathFilter,
    pending: VecDeque<PathBuf>,
}

impl FsWatcher {
    /// Watch `roots`; `filter` sees paths relative to the root they fall under.
    pub fn new<F>(roots: &[PathBuf], filter: F) -> Result<Self, WatchError>
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;

        let mut watched = Vec::with_capacity(roots.len());
        for root in roots {
            let path = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
            let is_dir = path.is_dir();
            if is_dir {
                watcher.watch(&path, RecursiveMode::Recursive)?;
            } else {
                // Editors replace files on save, so follow the parent.
                let parent = path
                    .parent()
                    .ok_or_else(|| WatchError::Backend(format!("cannot watch {}", path.display())))?;
                watcher.watch(parent, RecursiveMode::NonRecursive)?;
            }
            debug!(path = %path.display(), "watching");
            watched.push(Root { path, is_dir });
        }

        Ok(Self {
            _watcher: watcher,
            events,
            roots: watched,
            filter: Box::new(filter),
            pending: VecDeque::new(),
        })
    }

    /// Watch source trees for Rust source and manifest changes.
    pub fn sources(roots: &[PathBuf]) -> Result<Self, WatchError> {
        Self::new(roots, is_source_file)
    }

    /// Next changed path.
    pub async fn next(&mut self, token: &CancellationToken) -> Result<PathBuf, WatchError> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                return Ok(path);
            }

            let event = tokio::select! {
                _ = token.cancelled() => return Err(WatchError::Cancelled),
                event = self.events.recv() => event.ok_or(WatchError::Closed)?,
            };

            match event {
                Ok(event) if is_change(&event.kind) => {
                    for path in event.paths {
                        if self.qualifies(&path) && !self.pending.contains(&path) {
                            self.pending.push_back(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        }
    }

    fn qualifies(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| {
            if root.is_dir {
                path.strip_prefix(&root.path)
                    .map(|relative| (self.filter)(relative))
                    .unwrap_or(false)
            } else {
                path == root.path
            }
        })
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// `.rs` files, `Cargo.toml` and `Cargo.lock`, outside hidden and `target` directories.
pub fn is_source_file(relative: &Path) -> bool {
    let hidden_or_target = relative.components().any(|c| match c {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || name == "target"
        }
        _ => false,
    });
    if hidden_or_target {
        return false;
    }
    match relative.file_name().and_then(|n| n.to_str()) {
        Some("Cargo.toml") | Some("Cargo.lock") => true,
        _ => relative.extension().is_some_and(|ext| ext == "rs"),
    }
}

/// `.yml` and `.yaml` files.
pub fn is_manifest_file(relative: &Path) -> bool {
    relative
        .extension()
        .is_some_and(|ext| ext == "yml" || ext == "yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn source_filter_accepts_rust_and_manifests() {
        assert!(is_source_file(Path::new("src/main.rs")));
        assert!(is_source_file(Path::new("crates/agent/Cargo.toml")));
        assert!(is_source_file(Path::new("Cargo.lock")));
        assert!(!is_source_file(Path::new("README.md")));
        assert!(!is_source_file(Path::new("target/debug/build.rs")));
        assert!(!is_source_file(Path::new(".git/hooks/x.rs")));
        assert!(!is_source_file(Path::new("src/.main.rs.swp")));
    }

    #[test]
    fn manifest_filter_accepts_yaml() {
        assert!(is_manifest_file(Path::new("wf.yaml")));
        assert!(is_manifest_file(Path::new("a/b.yml")));
        assert!(!is_manifest_file(Path::new("a/b.json")));
    }

    #[tokio::test]
    async fn reports_changed_source_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let mut watcher = FsWatcher::sources(&[dir.path().to_path_buf()]).unwrap();
        let token = CancellationToken::new();

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(10), watcher.next(&token))
            .await
            .expect("no event within timeout")
            .unwrap();
        assert!(path.ends_with("src/main.rs"), "got {}", path.display());
    }

    #[tokio::test]
    async fn watches_single_file_roots() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("workflow.yaml");
        std::fs::write(&file, "kind: TestWorkflow").unwrap();
        let mut watcher = FsWatcher::new(&[file.clone()], is_manifest_file).unwrap();
        let token = CancellationToken::new();

        std::fs::write(dir.path().join("other.yaml"), "kind: TestWorkflow").unwrap();
        std::fs::write(&file, "kind: TestWorkflow\n").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(10), watcher.next(&token))
            .await
            .expect("no event within timeout")
            .unwrap();
        assert!(path.ends_with("workflow.yaml"), "got {}", path.display());
    }

    #[tokio::test]
    async fn cancellation_ends_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FsWatcher::sources(&[dir.path().to_path_buf()]).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            watcher.next(&token).await,
            Err(WatchError::Cancelled)
        ));
    }
}
