//! Activity tracking for idle detection

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Touch `path` every `interval` until `cancel` fires
pub async fn track_activity(path: PathBuf, interval: Duration, cancel: CancellationToken) {
    tracing::debug!("Tracking activity in {}", path.display());
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = touch(&path) {
                    tracing::warn!("Failed to update activity file {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_activity_file_is_created_and_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity");
        let cancel = CancellationToken::new();

        let task = tokio::spawn(track_activity(
            path.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists());
        let first = std::fs::metadata(&path).unwrap().modified().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(second >= first);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
