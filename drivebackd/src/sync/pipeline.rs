use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use driveback_core::{ApiErrorClass, RemoteFile, SourceClient, SourceError};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::dest::Destination;
use crate::state::{StateError, StateStore, now_unix};
use crate::sync::dedup::transfer_needed;
use crate::sync::retry::RetryScheduler;
use crate::sync::staging::StagingLease;
use crate::sync::transfer::{TransferClient, TransferError};

/// How one file's run through the pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Every targeted destination holds the file, whether we transferred it
    /// this run or skipped it as already present.
    Synced {
        transferred: usize,
        skipped: usize,
        bytes_transferred: u64,
    },
    /// At least one destination took the file, at least one did not.
    /// Destinations succeed and fail independently.
    PartiallyFailed {
        succeeded: usize,
        failed: usize,
        bytes_transferred: u64,
    },
    /// The source download itself failed; no destination was attempted.
    /// Transient failures queue retries for every still-needing destination;
    /// a size mismatch leaves the records Pending for rediscovery of the
    /// changed version.
    DownloadFailed { error: String },
}

/// Download-once, fan-out-upload worker: stages the source bytes exactly once
/// per run and pushes them to every destination that still needs them.
pub struct TransferPipeline {
    source: SourceClient,
    transfer: TransferClient,
    store: StateStore,
    retry: RetryScheduler,
    op_timeout: Duration,
}

impl TransferPipeline {
    pub fn new(
        source: SourceClient,
        transfer: TransferClient,
        store: StateStore,
        retry: RetryScheduler,
        op_timeout: Duration,
    ) -> Self {
        Self {
            source,
            transfer,
            store,
            retry,
            op_timeout,
        }
    }

    /// Runs one file against its routed destinations. The staging lease is
    /// consumed here; its Drop releases the disk budget and deletes the
    /// staged artifact no matter how the run ends.
    pub async fn run(
        &self,
        file: &RemoteFile,
        targets: &[Arc<Destination>],
        lease: StagingLease,
    ) -> Result<FileOutcome, StateError> {
        let now = now_unix();
        let source_path = materialized_path(file);

        for target in targets {
            self.store.ensure_record(&file.id, target.id(), now).await?;
        }

        // Size-probe each destination first so a fully present file costs no
        // download at all.
        let mut needing: Vec<(&Arc<Destination>, String)> = Vec::new();
        let mut skipped = 0usize;
        for target in targets {
            let remote_path = target.remote_path_for(&source_path);
            if transfer_needed(target, &remote_path, file.size).await {
                needing.push((target, remote_path));
            } else {
                debug!(
                    file_id = file.id.as_str(),
                    destination_id = target.id(),
                    remote_path,
                    "already present at matching size, skipping transfer"
                );
                self.store
                    .mark_synced(&file.id, target.id(), &remote_path, file.size as i64, now)
                    .await?;
                self.retry.record_success(&file.id, target.id()).await?;
                skipped += 1;
            }
        }

        if needing.is_empty() {
            return Ok(FileOutcome::Synced {
                transferred: 0,
                skipped,
                bytes_transferred: 0,
            });
        }

        if let Err(err) = self.download(file, &lease).await {
            let error = err.to_string();
            if err.is_size_mismatch() {
                // The source bytes disagree with the declared snapshot.
                // Records stay Pending for rediscovery of the changed
                // version; a retry would just re-fetch stale data.
                warn!(
                    file_id = file.id.as_str(),
                    path = file.path.as_str(),
                    error,
                    "download verification failed, awaiting rediscovery"
                );
            } else {
                warn!(
                    file_id = file.id.as_str(),
                    path = file.path.as_str(),
                    error,
                    "source download failed, queuing retries"
                );
                let now = now_unix();
                for (target, _) in &needing {
                    self.retry
                        .record_failure(&file.id, target.id(), err.classification(), &error, now)
                        .await?;
                }
            }
            return Ok(FileOutcome::DownloadFailed { error });
        }

        // Uploads run concurrently and settle independently; one slow or
        // broken destination never blocks the others' bookkeeping.
        let uploads = needing.iter().map(|(target, remote_path)| async {
            let result =
                tokio::time::timeout(self.op_timeout, target.put(lease.path(), remote_path)).await;
            (target.id(), remote_path.as_str(), result)
        });

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut bytes_transferred = 0u64;
        for (destination_id, remote_path, result) in join_all(uploads).await {
            let now = now_unix();
            match result {
                Ok(Ok(bytes)) => {
                    info!(
                        file_id = file.id.as_str(),
                        destination_id, remote_path, bytes, "uploaded"
                    );
                    self.store
                        .mark_synced(&file.id, destination_id, remote_path, bytes as i64, now)
                        .await?;
                    self.retry.record_success(&file.id, destination_id).await?;
                    succeeded += 1;
                    bytes_transferred += bytes;
                }
                Ok(Err(err)) => {
                    self.retry
                        .record_failure(
                            &file.id,
                            destination_id,
                            err.classification(),
                            &err.to_string(),
                            now,
                        )
                        .await?;
                    failed += 1;
                }
                Err(_) => {
                    self.retry
                        .record_failure(
                            &file.id,
                            destination_id,
                            ApiErrorClass::Transient,
                            "upload timed out",
                            now,
                        )
                        .await?;
                    failed += 1;
                }
            }
        }

        drop(lease);

        if failed == 0 {
            Ok(FileOutcome::Synced {
                transferred: succeeded,
                skipped,
                bytes_transferred,
            })
        } else {
            Ok(FileOutcome::PartiallyFailed {
                succeeded: succeeded + skipped,
                failed,
                bytes_transferred,
            })
        }
    }

    async fn download(&self, file: &RemoteFile, lease: &StagingLease) -> Result<(), DownloadError> {
        let link = tokio::time::timeout(
            self.op_timeout,
            self.source.get_download_link(&file.id, file.export),
        )
        .await
        .map_err(|_| DownloadError::Timeout)??;

        tokio::time::timeout(
            self.op_timeout,
            self.transfer
                .download_to_path_verified(link.href.as_str(), lease.path(), file.size),
        )
        .await
        .map_err(|_| DownloadError::Timeout)??;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error("download link: {0}")]
    Link(#[from] SourceError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("download timed out")]
    Timeout,
}

impl DownloadError {
    fn is_size_mismatch(&self) -> bool {
        matches!(self, DownloadError::Transfer(err) if err.is_size_mismatch())
    }

    fn classification(&self) -> ApiErrorClass {
        match self {
            DownloadError::Link(err) => {
                err.classification().unwrap_or(ApiErrorClass::Transient)
            }
            DownloadError::Transfer(TransferError::Url(_)) => ApiErrorClass::Permanent,
            DownloadError::Transfer(_) | DownloadError::Timeout => ApiErrorClass::Transient,
        }
    }
}

/// Destination key for the file's content. Proprietary documents are
/// materialized in their export format, so the key carries that extension.
pub fn materialized_path(file: &RemoteFile) -> String {
    match file.export {
        Some(format) => format!("{}.{}", file.path, format.extension()),
        None => file.path.clone(),
    }
}

/// Groups routed files by destination id for status reporting.
pub fn targets_by_id<'a>(
    destinations: &'a HashMap<String, Arc<Destination>>,
    ids: &[String],
) -> Vec<Arc<Destination>> {
    ids.iter()
        .filter_map(|id| destinations.get(id).cloned())
        .collect()
}
