use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl TransferError {
    /// A size mismatch means the source bytes disagree with the declared
    /// snapshot; the run must fail hard rather than retry stale data.
    pub fn is_size_mismatch(&self) -> bool {
        matches!(self, TransferError::SizeMismatch { .. })
    }
}

/// Streams source downloads into staging files, bounded by a download
/// concurrency limit that is independent of the worker pool.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(download_concurrency: usize) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(download_concurrency.max(1))),
        }
    }

    /// Downloads `href` into `target`, writing through a `.partial` sibling
    /// that is renamed only after the byte count matches `expected_len`. The
    /// partial file is removed on every error path.
    pub async fn download_to_path_verified(
        &self,
        href: &str,
        target: &Path,
        expected_len: u64,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        if let Err(err) = stream_to_file(response, &partial, expected_len).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&partial, target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.into());
        }
        Ok(())
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    partial: &Path,
    expected_len: u64,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    if written != expected_len {
        return Err(TransferError::SizeMismatch {
            expected: expected_len,
            actual: written,
        });
    }
    Ok(())
}

pub(crate) fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
