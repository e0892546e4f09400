//! Source watcher that triggers rebuilds.

use crate::config::WatchConfig;
use crate::error::ProxyError;
use log::{debug, error, info};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Decides which changed paths are worth a rebuild.
#[derive(Debug, Clone)]
struct PathFilter {
    /// Watched roots as configured and canonicalized; event paths are judged relative to them
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    ignore: Vec<String>,
}

impl PathFilter {
    fn new(config: &WatchConfig) -> Self {
        let mut roots = Vec::new();
        for path in &config.paths {
            roots.push(path.clone());
            if let Ok(canonical) = path.canonicalize() {
                roots.push(canonical);
            }
        }
        Self {
            roots,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            ignore: config.ignore.clone(),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        let relative = self
            .roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);

        // Hidden entries and ignored directories anywhere below the root
        let skipped = relative.components().any(|c| match c.as_os_str().to_str() {
            Some(name) => (name.starts_with('.') && name != "." && name != "..") || self.ignore.iter().any(|i| i == name),
            None => false,
        });
        if skipped {
            return false;
        }

        if self.extensions.is_empty() {
            return true;
        }
        relative
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }
}

/// Recursive filesystem watch over the configured paths. Matching events are
/// funnelled into a channel and coalesced by [`Watcher::changed`].
pub struct Watcher {
    // Kept alive for as long as events are wanted
    _watcher: RecommendedWatcher,
    changes: mpsc::Receiver<PathBuf>,
    settle: Duration,
}

impl Watcher {
    pub fn new(config: WatchConfig) -> Result<Self, ProxyError> {
        let filter = PathFilter::new(&config);
        let (tx, changes) = mpsc::channel(1);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                    return;
                }
                if let Some(path) = event.paths.into_iter().find(|p| filter.matches(p)) {
                    debug!("Source change: {:?} {}", event.kind, path.display());
                    // A pending signal already covers this change
                    let _ = tx.try_send(path);
                }
            }
            Err(e) => error!("File watch error: {:?}", e),
        })?;

        for path in &config.paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
        info!("Watching {:?} for changes", config.paths);

        Ok(Self {
            _watcher: watcher,
            changes,
            settle: Duration::from_millis(config.debounce_ms),
        })
    }

    /// Wait for the next relevant change. A burst of events (an editor save,
    /// a `git checkout`) is folded into one by waiting out the debounce period.
    /// Returns false once the watch has stopped.
    pub async fn changed(&mut self) -> bool {
        let Some(first) = self.changes.recv().await else {
            return false;
        };
        tokio::time::sleep(self.settle).await;
        while self.changes.try_recv().is_ok() {}

        info!("Source change detected: {}", first.display());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::time::timeout;

    fn config_for(dir: &Path, extensions: &[&str]) -> WatchConfig {
        WatchConfig {
            paths: vec![dir.to_path_buf()],
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            debounce_ms: 20,
            ..WatchConfig::default()
        }
    }

    #[test]
    fn test_filter_extensions_and_ignored_dirs() {
        let filter = PathFilter::new(&config_for(Path::new("/src/app"), &[".go"]));

        assert!(filter.matches(Path::new("/src/app/main.go")));
        assert!(filter.matches(Path::new("/src/app/pkg/util.go")));
        assert!(!filter.matches(Path::new("/src/app/notes.txt")));
        assert!(!filter.matches(Path::new("/src/app/target/gen.go")));
        assert!(!filter.matches(Path::new("/src/app/node_modules/x/y.go")));
        assert!(!filter.matches(Path::new("/src/app/.git/HEAD.go")));
        assert!(!filter.matches(Path::new("/src/app/.main.go.swp")));
    }

    #[test]
    fn test_filter_judges_paths_below_the_root() {
        // The root itself may live under a hidden directory
        let filter = PathFilter::new(&config_for(Path::new("/tmp/.tmpA1b2/app"), &[]));
        assert!(filter.matches(Path::new("/tmp/.tmpA1b2/app/main.go")));
        assert!(!filter.matches(Path::new("/tmp/.tmpA1b2/app/.cache/x")));
    }

    #[tokio::test]
    async fn test_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new(config_for(dir.path(), &["go"])).unwrap();

        fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        assert!(timeout(Duration::from_secs(5), watcher.changed()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ignored_changes_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("target")).unwrap();
        let mut watcher = Watcher::new(config_for(dir.path(), &[])).unwrap();

        fs::write(dir.path().join("target").join("app"), "bin").unwrap();
        assert!(timeout(Duration::from_millis(500), watcher.changed()).await.is_err());

        fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        assert!(timeout(Duration::from_secs(5), watcher.changed()).await.unwrap());
    }

    #[tokio::test]
    async fn test_deletion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("old.go");
        fs::write(&file, "package main\n").unwrap();
        let mut watcher = Watcher::new(config_for(dir.path(), &[])).unwrap();

        fs::remove_file(&file).unwrap();
        assert!(timeout(Duration::from_secs(5), watcher.changed()).await.unwrap());
    }

    #[test]
    fn test_missing_path_fails() {
        let config = config_for(Path::new("/nonexistent/devgate-src"), &[]);
        assert!(matches!(Watcher::new(config), Err(ProxyError::Watch(_))));
    }
}
