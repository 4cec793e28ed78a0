use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use indicatif::ProgressBar;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::SyncError;
use crate::kobo::Fetcher;
use crate::progress::create_progress_bar;
use crate::retry::{self, RetryAction, RetryConfig};
use crate::store::{self, ContentHash, StoreError};

/// Settings for a single image download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Attempts for the whole transfer, on top of the fetcher's own
    /// attempts to open the stream.
    pub max_attempts: u32,
    /// Longest gap between two received chunks.
    pub idle_timeout: Duration,
    pub no_progress_bar: bool,
}

/// Download `url` to `dest` through a sibling `.part` file and return the
/// content hash.
///
/// Each attempt starts from scratch. A transfer that stalls for longer
/// than the idle timeout, or ends short of the declared length, counts as
/// a failed attempt. On success the `.part` file is renamed over `dest`.
pub async fn download_image(
    fetcher: &Fetcher,
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
) -> Result<ContentHash, SyncError> {
    let dest = store::absolute(dest)?;
    if let Some(parent) = dest.parent() {
        store::ensure_dir(parent).await?;
    }
    let part_path = store::part_path(&dest);
    let retry_config = RetryConfig::immediate(options.max_attempts, None);

    let result = retry::retry_with_timeout(
        &retry_config,
        |e: &SyncError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        |_| attempt_download(fetcher, url, &dest, &part_path, options),
    )
    .await;

    match result {
        Ok(hash) => Ok(hash),
        Err(failure) => {
            let _ = fs::remove_file(&part_path).await;
            if failure.error.is_retryable() {
                tracing::warn!(
                    "Giving up on {} after {} attempt(s)",
                    dest.display(),
                    failure.attempts
                );
            }
            Err(failure.error)
        }
    }
}

/// Single transfer attempt with incremental hashing.
async fn attempt_download(
    fetcher: &Fetcher,
    url: &str,
    dest: &Path,
    part_path: &Path,
    options: &DownloadOptions,
) -> Result<ContentHash, SyncError> {
    let _ = fs::remove_file(part_path).await;
    let stream = fetcher.stream(url).await?;
    let expected = stream.content_length.unwrap_or_default();
    let mut body = stream.body;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await
        .map_err(|e| StoreError::io("open", part_path, e))?;

    let pb = create_progress_bar(options.no_progress_bar, expected);
    pb.set_message(
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let mut hasher = Sha256::new();
    let mut received: u64 = 0;
    loop {
        let chunk = match tokio::time::timeout(options.idle_timeout, body.next()).await {
            Err(_) => {
                finish(&pb);
                return Err(SyncError::Stalled {
                    url: url.to_string(),
                    idle_ms: options.idle_timeout.as_millis(),
                    received,
                });
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                finish(&pb);
                return Err(SyncError::Body {
                    url: url.to_string(),
                    received,
                    reason: e.to_string(),
                });
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| StoreError::io("write", part_path, e))?;
        received += chunk.len() as u64;
        pb.set_position(received);
    }
    file.flush()
        .await
        .map_err(|e| StoreError::io("flush", part_path, e))?;
    drop(file);
    finish(&pb);

    if received != expected {
        let _ = fs::remove_file(part_path).await;
        return Err(SyncError::PartialDownload {
            url: url.to_string(),
            expected,
            received,
        });
    }

    fs::rename(part_path, dest)
        .await
        .map_err(|e| StoreError::io("rename", part_path, e))?;
    Ok(ContentHash::from_hasher(hasher))
}

fn finish(pb: &ProgressBar) {
    pb.finish_and_clear();
}
