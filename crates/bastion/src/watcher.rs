//! Debounced file watching for live reloads.
//!
//! Policy and allow-list files reload on change. Editors tend to emit a
//! burst of write events per save, so events are coalesced behind a
//! short debounce before the reload callback runs. A failed reload keeps
//! the previous state active.

use bastion_common::constants::WATCH_DEBOUNCE_MILLIS;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// Watch a file and invoke `on_change` after each debounced burst of
/// write/create events. The returned watcher must be kept alive for the
/// watch to stay active.
pub fn watch_file<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.send(());
            }
        }
        Err(e) => {
            error!(error = %e, "file watcher error");
        }
    })?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;

    let path_display = path.display().to_string();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Swallow the rest of the write storm before reloading.
            tokio::time::sleep(Duration::from_millis(WATCH_DEBOUNCE_MILLIS)).await;
            while rx.try_recv().is_ok() {}

            info!(file = %path_display, "reloading after change");
            on_change();
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_burst_of_writes_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.yaml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        let _watcher = watch_file(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Editor-style write storm.
        for i in 0..5 {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            writeln!(f, "a: {i}").unwrap();
            f.sync_all().unwrap();
        }

        tokio::time::sleep(Duration::from_millis(600)).await;

        let count = reloads.load(Ordering::SeqCst);
        assert!(count >= 1, "no reload observed");
        assert!(count <= 2, "debounce failed, saw {count} reloads");
    }
}
