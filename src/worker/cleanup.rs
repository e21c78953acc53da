//! Deferred removal of temporary batch state.
//!
//! Request paths only enqueue a [`CleanupRequest`]; a single worker task owns
//! the timers and the deletions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRequest {
    pub path: PathBuf,
    pub delay: Duration,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("cleanup worker is no longer running")]
    WorkerGone,
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    tx: mpsc::UnboundedSender<CleanupRequest>,
    default_delay: Duration,
}

impl CleanupScheduler {
    pub fn channel(default_delay: Duration) -> (Self, mpsc::UnboundedReceiver<CleanupRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, default_delay }, rx)
    }

    pub fn schedule(&self, path: impl Into<PathBuf>) -> Result<(), CleanupError> {
        self.schedule_after(path, self.default_delay)
    }

    pub fn schedule_after(
        &self,
        path: impl Into<PathBuf>,
        delay: Duration,
    ) -> Result<(), CleanupError> {
        let path = path.into();
        self.tx
            .send(CleanupRequest {
                path: path.clone(),
                delay,
            })
            .map_err(|_| {
                warn!(path = %path.display(), "cleanup worker gone; path left in place");
                CleanupError::WorkerGone
            })
    }
}

/// Runs until `shutdown` fires. Paths whose delay has not elapsed by then are
/// removed immediately so nothing outlives the process.
pub fn spawn_cleanup_worker(
    mut rx: mpsc::UnboundedReceiver<CleanupRequest>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timers = JoinSet::<PathBuf>::new();
        let mut pending = HashSet::<PathBuf>::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => {
                    let Some(CleanupRequest { path, delay }) = request else {
                        break;
                    };
                    if !pending.insert(path.clone()) {
                        continue;
                    }
                    timers.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(error) = remove_path(path.as_path()).await {
                            error!(error = %error, "cleanup failed");
                        }
                        path
                    });
                }
                Some(done) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok(path) = done {
                        pending.remove(&path);
                    }
                }
            }
        }

        timers.abort_all();
        while let Ok(request) = rx.try_recv() {
            pending.insert(request.path);
        }
        for path in pending {
            if let Err(error) = remove_path(path.as_path()).await {
                error!(error = %error, "cleanup at shutdown failed");
            }
        }
        info!("cleanup worker stopped");
    })
}

pub async fn remove_path(path: &Path) -> Result<(), CleanupError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => {
            warn!(path = %path.display(), "path not found for cleanup");
            return Ok(());
        }
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(|source| CleanupError::Remove {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "removed temporary path");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("atlas_cleanup_{label}_{stamp}"));
        fs::create_dir_all(path.join("Images")).expect("temp dir should exist");
        fs::write(path.join("Images").join("a.tif"), b"x").expect("write");
        path
    }

    #[tokio::test]
    async fn scheduled_directory_is_removed_after_delay() {
        let dir = temp_dir("delay");
        let (scheduler, rx) = CleanupScheduler::channel(Duration::from_secs(300));
        let shutdown = CancellationToken::new();
        let worker = spawn_cleanup_worker(rx, shutdown.clone());

        scheduler
            .schedule_after(dir.clone(), Duration::from_millis(20))
            .expect("schedule should succeed");
        assert!(dir.exists());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.exists());

        shutdown.cancel();
        worker.await.expect("worker should stop");
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_removals() {
        let dir = temp_dir("flush");
        let file = std::env::temp_dir().join(format!(
            "atlas_cleanup_file_{}.zip",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time should be monotonic")
                .as_nanos()
        ));
        fs::write(file.as_path(), b"zip").expect("write");
        let (scheduler, rx) = CleanupScheduler::channel(Duration::from_secs(3_600));
        let shutdown = CancellationToken::new();
        let worker = spawn_cleanup_worker(rx, shutdown.clone());

        scheduler.schedule(dir.clone()).expect("schedule dir");
        scheduler.schedule(file.clone()).expect("schedule file");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dir.exists());

        shutdown.cancel();
        worker.await.expect("worker should stop");

        assert!(!dir.exists());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn schedule_reports_worker_gone() {
        let (scheduler, rx) = CleanupScheduler::channel(Duration::from_secs(1));
        drop(rx);

        assert!(matches!(
            scheduler.schedule("/tmp/never"),
            Err(CleanupError::WorkerGone)
        ));
    }

    #[tokio::test]
    async fn remove_path_tolerates_missing_targets() {
        let missing = std::env::temp_dir().join("atlas_cleanup_definitely_missing");
        remove_path(missing.as_path())
            .await
            .expect("missing path is not an error");
    }
}
