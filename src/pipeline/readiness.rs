//! Waiting for a specific artifact that an external process is still writing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::ReadinessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    /// How long to wait for the file to appear at all.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Size polls allowed once the file exists.
    pub stability_rounds: u32,
}

impl StabilityPolicy {
    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.file_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stability_rounds: config.stability_rounds,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("file not created within {waited:?}: {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("file size never stabilized (last size {last_size}): {path}")]
    Unstable { path: PathBuf, last_size: u64 },
    #[error("file created but empty: {path}")]
    Empty { path: PathBuf },
}

/// Succeeds with the file size once two consecutive polls observe the same
/// non-zero size.
pub async fn await_stable_file(path: &Path, policy: &StabilityPolicy) -> Result<u64, ReadinessError> {
    let deadline = Instant::now() + policy.timeout;
    while tokio::fs::metadata(path).await.is_err() {
        if Instant::now() >= deadline {
            warn!(path = %path.display(), "timeout reached waiting for file");
            return Err(ReadinessError::Timeout {
                path: path.to_path_buf(),
                waited: policy.timeout,
            });
        }
        sleep(policy.poll_interval).await;
    }

    let mut previous = None::<u64>;
    for round in 0..policy.stability_rounds.max(2) {
        let size = tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        if size > 0 && previous == Some(size) {
            debug!(path = %path.display(), size, round, "file size stable");
            return Ok(size);
        }
        previous = Some(size);
        sleep(policy.poll_interval).await;
    }

    match previous {
        Some(0) | None => Err(ReadinessError::Empty {
            path: path.to_path_buf(),
        }),
        Some(last_size) => Err(ReadinessError::Unstable {
            path: path.to_path_buf(),
            last_size,
        }),
    }
}

/// Waits until `path` can be read and holds non-blank text.
pub async fn await_file_content(
    path: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<String, ReadinessError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            let content = content.trim();
            if !content.is_empty() {
                return Ok(content.to_string());
            }
        }
        if Instant::now() >= deadline {
            warn!(path = %path.display(), "timeout reached waiting for file content");
            return Err(ReadinessError::Timeout {
                path: path.to_path_buf(),
                waited: timeout,
            });
        }
        sleep(poll_interval).await;
    }
}
