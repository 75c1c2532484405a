//! Directory-watch + debounce primitive shared by the VCL and TLS reloaders.
//!
//! Watching the containing directory (rather than the file itself) observes
//! atomic replace/rename events, which is how Kubernetes ConfigMap and
//! Secret mounts publish updates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Spawns a directory watcher plus a debounce task. Events whose path
/// doesn't satisfy `filter` are ignored; qualifying events reset a debounce
/// timer, and exactly one notification is emitted per quiet period.
pub fn spawn_debounced_watch(
    dir: PathBuf,
    filter: impl Fn(&Path) -> bool + Send + Sync + 'static,
    debounce: Duration,
) -> (RecommendedWatcher, mpsc::Receiver<()>) {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = raw_tx.send(event);
        }
    })
    .expect("failed to construct filesystem watcher");

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .expect("failed to watch directory");

    let (debounced_tx, debounced_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let event = match raw_rx.recv().await {
                Some(e) => e,
                None => return,
            };

            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            if !event.paths.iter().any(|p| filter(p)) {
                continue;
            }

            loop {
                tokio::select! {
                    next = raw_rx.recv() => {
                        match next {
                            Some(_) => continue,
                            None => return,
                        }
                    }
                    _ = tokio::time::sleep(debounce) => break,
                }
            }

            if debounced_tx.send(()).await.is_err() {
                return;
            }
        }
    });

    (watcher, debounced_rx)
}

pub fn basename_matches(path: &Path, basename: &str) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(basename)
}

pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}
