use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use driveback_core::{RemoteFile, SourceClient};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::control::{CycleStats, DaemonCommand, DaemonHandle, DaemonStatus, RunState};
use crate::dest::Destination;
use crate::state::{FolderPolicy, RetryEntry, StateStore, now_unix};
use crate::sync::pipeline::{FileOutcome, TransferPipeline, targets_by_id};
use crate::sync::retry::{Backoff, RetryPolicy, RetryScheduler};
use crate::sync::staging::StagingArea;
use crate::sync::transfer::TransferClient;

const COMMAND_CHANNEL_DEPTH: usize = 32;
const DUE_RETRY_BATCH: i64 = 64;

/// One file waiting for a pipeline slot, already routed to its destinations.
#[derive(Debug, Clone)]
struct QueuedFile {
    file: RemoteFile,
    destination_ids: Vec<String>,
}

struct TaskResult {
    file_id: String,
    outcome: Result<FileOutcome, crate::state::StateError>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    source: SourceClient,
    store: StateStore,
    staging: StagingArea,
    destinations: Arc<HashMap<String, Arc<Destination>>>,
    pipeline: Arc<TransferPipeline>,
    tx: mpsc::Sender<DaemonCommand>,
    rx: Option<mpsc::Receiver<DaemonCommand>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.staging_dir)
            .await
            .with_context(|| {
                format!("failed to create staging dir at {:?}", config.staging_dir)
            })?;

        let source = match config.source_url.as_deref() {
            Some(url) => SourceClient::with_base_url(url, config.source_token.clone()),
            None => SourceClient::new(config.source_token.clone()),
        }
        .context("failed to build source client")?;

        let store = StateStore::open(config.state_db.clone())
            .await
            .context("failed to open state store")?;

        let mut destinations = HashMap::new();
        for dest_config in &config.destinations {
            let destination = Destination::new(dest_config)
                .with_context(|| format!("invalid destination {}", dest_config.id))?;
            destinations.insert(dest_config.id.clone(), Arc::new(destination));
        }
        let destinations = Arc::new(destinations);

        let staging = StagingArea::new(config.staging_dir.clone(), config.staging_quota_bytes);
        let retry = RetryScheduler::new(
            store.clone(),
            RetryPolicy {
                max_attempts: config.retry_max_attempts,
                transient: Backoff::new(config.retry_base, config.retry_max, true),
                rate_limited: Backoff::new(config.retry_rate_limit_base, config.retry_max, true),
            },
        );
        let pipeline = Arc::new(TransferPipeline::new(
            source.clone(),
            TransferClient::new(config.workers),
            store.clone(),
            retry,
            config.op_timeout,
        ));

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        Ok(Self {
            config,
            source,
            store,
            staging,
            destinations,
            pipeline,
            tx,
            rx: Some(rx),
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle::new(self.tx.clone())
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            staging_dir = %self.config.staging_dir.display(),
            destinations = self.destinations.len(),
            workers = self.config.workers,
            poll_secs = self.config.poll_interval.as_secs(),
            "daemon started"
        );

        let mut rx = self.rx.take().context("daemon loop already consumed")?;
        let started_at = std::time::Instant::now();
        let mut state = RunState::Running;
        let mut stats = CycleStats::default();
        let mut pending: VecDeque<QueuedFile> = VecDeque::new();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut since: i64 = 0;

        self.store.set_daemon_state(state.as_str(), now_unix()).await?;

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.admit_pending(&mut state, &mut pending, &mut tasks, &mut stats)
                .await?;

            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped; nothing can drive us anymore.
                        break;
                    };
                    self.handle_command(command, &mut state, &mut pending, &mut since, &stats, started_at)
                        .await?;
                    if state == RunState::Stopping {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(result) => tally(result, &mut stats),
                        Err(err) => {
                            error!(error = %err, "pipeline task panicked");
                            stats.last_error = Some(err.to_string());
                        }
                    }
                }
                _ = tick.tick(), if state == RunState::Running => {
                    self.run_cycle(&mut pending, &mut since, &mut stats).await;
                }
            }
        }

        // Let in-flight transfers settle; the pending queue is discarded and
        // rediscovered on the next start.
        info!(in_flight = tasks.len(), "stopping, draining in-flight transfers");
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => tally(result, &mut stats),
                Err(err) => error!(error = %err, "pipeline task panicked"),
            }
        }
        self.store.set_daemon_state("stopped", now_unix()).await?;
        info!(
            files_synced = stats.files_synced,
            files_failed = stats.files_failed,
            bytes_transferred = stats.bytes_transferred,
            "daemon stopped"
        );
        Ok(())
    }

    /// Fills free worker slots from the pending queue. A file the staging
    /// budget cannot fit right now goes back to the front; a file larger than
    /// the whole budget can never run and goes terminal Failed.
    async fn admit_pending(
        &self,
        state: &mut RunState,
        pending: &mut VecDeque<QueuedFile>,
        tasks: &mut JoinSet<TaskResult>,
        stats: &mut CycleStats,
    ) -> anyhow::Result<()> {
        while *state == RunState::Running && tasks.len() < self.config.workers {
            let Some(queued) = pending.pop_front() else {
                break;
            };

            if self.staging.exceeds_quota(queued.file.size) {
                warn!(
                    file_id = queued.file.id.as_str(),
                    size = queued.file.size,
                    quota = self.staging.quota_bytes(),
                    "file exceeds the whole staging budget, failing terminally"
                );
                let now = now_unix();
                for destination_id in &queued.destination_ids {
                    self.store.ensure_record(&queued.file.id, destination_id, now).await?;
                    self.store
                        .mark_failed_terminal(
                            &queued.file.id,
                            destination_id,
                            "file exceeds staging budget",
                            now,
                        )
                        .await?;
                }
                stats.files_failed += 1;
                continue;
            }

            let Some(lease) = self.staging.try_admit(&queued.file.id, queued.file.size) else {
                // Budget is full; wait for an in-flight run to release it.
                pending.push_front(queued);
                break;
            };

            let targets = targets_by_id(&self.destinations, &queued.destination_ids);
            if targets.is_empty() {
                warn!(
                    file_id = queued.file.id.as_str(),
                    "policy names no configured destinations, skipping"
                );
                continue;
            }

            let pipeline = Arc::clone(&self.pipeline);
            let file = queued.file;
            tasks.spawn(async move {
                let file_id = file.id.clone();
                let outcome = pipeline.run(&file, &targets, lease).await;
                TaskResult { file_id, outcome }
            });
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        command: DaemonCommand,
        state: &mut RunState,
        pending: &mut VecDeque<QueuedFile>,
        since: &mut i64,
        stats: &CycleStats,
        started_at: std::time::Instant,
    ) -> anyhow::Result<()> {
        match command {
            DaemonCommand::Stop => {
                info!("stop requested");
                *state = RunState::Stopping;
                self.store.set_daemon_state(state.as_str(), now_unix()).await?;
            }
            DaemonCommand::Pause => {
                if *state == RunState::Running {
                    info!(pending = pending.len(), "paused; queued work is retained");
                    *state = RunState::Paused;
                    self.store.set_daemon_state(state.as_str(), now_unix()).await?;
                }
            }
            DaemonCommand::Resume => {
                if *state == RunState::Paused {
                    info!("resumed");
                    *state = RunState::Running;
                    self.store.set_daemon_state(state.as_str(), now_unix()).await?;
                }
            }
            DaemonCommand::ForceSync(file_id) => {
                if *state != RunState::Running {
                    debug!("force sync ignored while not running");
                } else if let Some(file_id) = file_id {
                    self.force_sync_file(&file_id, pending).await;
                } else {
                    let mut stats_scratch = CycleStats::default();
                    self.run_cycle(pending, since, &mut stats_scratch).await;
                }
            }
            DaemonCommand::Status(reply) => {
                let destinations = self.store.counts_by_destination().await?;
                let retry_queue_len = self.store.retry_queue_len().await?;
                let _ = reply.send(DaemonStatus {
                    run_state: *state,
                    uptime: started_at.elapsed(),
                    destinations,
                    retry_queue_len,
                    staging_used_bytes: self.staging.used_bytes(),
                    staging_quota_bytes: self.staging.quota_bytes(),
                    stats: stats.clone(),
                });
            }
            DaemonCommand::ListFailed(reply) => {
                let _ = reply.send(self.store.list_failed().await?);
            }
            DaemonCommand::Retry {
                file_id,
                destination_id,
                reply,
            } => {
                let reset = self
                    .store
                    .reset_failed(&file_id, &destination_id, now_unix())
                    .await?;
                if reset {
                    // Immediately eligible; the next retry sweep picks it up.
                    self.store
                        .push_retry(&file_id, &destination_id, 0, now_unix())
                        .await?;
                    info!(file_id, destination_id, "failed record reset to pending");
                }
                let _ = reply.send(reset);
            }
        }
        Ok(())
    }

    /// Pushes one specific file through the pipeline now, bypassing the
    /// change window.
    async fn force_sync_file(&self, file_id: &str, pending: &mut VecDeque<QueuedFile>) {
        let file = match self.source.get_file(file_id).await {
            Ok(file) => file,
            Err(err) => {
                warn!(file_id, error = %err, "force sync lookup failed");
                return;
            }
        };
        let policies = match self.store.list_policies().await {
            Ok(policies) => policies,
            Err(err) => {
                error!(error = %err, "failed to load folder policies");
                return;
            }
        };
        match crate::sync::policy::route_destinations(&policies, &file.path) {
            Some(policy) => pending.push_back(QueuedFile {
                destination_ids: policy.destinations.clone(),
                file,
            }),
            None => warn!(file_id, path = file.path.as_str(), "file is untracked"),
        }
    }

    /// One discovery cycle: list source changes since the last cycle, route
    /// them through folder policies, and sweep due retries back in.
    async fn run_cycle(
        &self,
        pending: &mut VecDeque<QueuedFile>,
        since: &mut i64,
        stats: &mut CycleStats,
    ) {
        let cycle_start = now_unix();
        let changed = match self.source.list_changed_all(*since).await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "change listing failed, will retry next cycle");
                stats.last_error = Some(err.to_string());
                return;
            }
        };
        let policies = match self.store.list_policies().await {
            Ok(policies) => policies,
            Err(err) => {
                error!(error = %err, "failed to load folder policies");
                stats.last_error = Some(err.to_string());
                return;
            }
        };

        let (queued, untracked) = plan_queue(changed, &policies);
        stats.files_untracked += untracked;
        let discovered = queued.len();
        pending.extend(queued);

        if let Err(err) = self.sweep_due_retries(pending).await {
            warn!(error = %err, "retry sweep failed, will retry next cycle");
            stats.last_error = Some(err.to_string());
        }

        *since = cycle_start;
        stats.cycles_completed += 1;
        debug!(discovered, untracked, pending = pending.len(), "cycle complete");
    }

    /// Re-queues files whose retry entries are due, with a fresh source
    /// snapshot so the retry uploads current bytes, not stale ones.
    async fn sweep_due_retries(
        &self,
        pending: &mut VecDeque<QueuedFile>,
    ) -> anyhow::Result<()> {
        let due = self.store.due_retries(now_unix(), DUE_RETRY_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }
        for (file_id, destination_ids) in group_due_retries(&due) {
            if pending.iter().any(|queued| queued.file.id == file_id) {
                continue;
            }
            match self.source.get_file(&file_id).await {
                Ok(file) => pending.push_back(QueuedFile {
                    file,
                    destination_ids,
                }),
                Err(err) => {
                    warn!(file_id, error = %err, "fresh snapshot failed, retry stays queued");
                }
            }
        }
        Ok(())
    }
}

fn tally(result: TaskResult, stats: &mut CycleStats) {
    match result.outcome {
        Ok(FileOutcome::Synced {
            transferred,
            skipped,
            bytes_transferred,
        }) => {
            debug!(
                file_id = result.file_id.as_str(),
                transferred, skipped, "file synced"
            );
            stats.files_synced += 1;
            stats.bytes_transferred += bytes_transferred;
        }
        Ok(FileOutcome::PartiallyFailed {
            succeeded,
            failed,
            bytes_transferred,
        }) => {
            warn!(
                file_id = result.file_id.as_str(),
                succeeded, failed, "file partially failed"
            );
            stats.files_failed += 1;
            stats.bytes_transferred += bytes_transferred;
        }
        Ok(FileOutcome::DownloadFailed { error }) => {
            stats.files_failed += 1;
            stats.last_error = Some(error);
        }
        Err(err) => {
            error!(file_id = result.file_id.as_str(), error = %err, "pipeline state error");
            stats.files_failed += 1;
            stats.last_error = Some(err.to_string());
        }
    }
}

/// Routes changed files through folder policies. Files under no enabled
/// policy are counted but never queued.
fn plan_queue(files: Vec<RemoteFile>, policies: &[FolderPolicy]) -> (Vec<QueuedFile>, u64) {
    let mut queued = Vec::new();
    let mut untracked = 0u64;
    for file in files {
        match crate::sync::policy::route_destinations(policies, &file.path) {
            Some(policy) => queued.push(QueuedFile {
                destination_ids: policy.destinations.clone(),
                file,
            }),
            None => untracked += 1,
        }
    }
    (queued, untracked)
}

/// Groups due retry entries per file, preserving destination order.
fn group_due_retries(entries: &[RetryEntry]) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for entry in entries {
        match grouped.iter_mut().find(|(file_id, _)| *file_id == entry.file_id) {
            Some((_, destinations)) => destinations.push(entry.destination_id.clone()),
            None => grouped.push((entry.file_id.clone(), vec![entry.destination_id.clone()])),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_file(id: &str, path: &str, size: u64) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            size,
            modified: None,
            export: None,
        }
    }

    fn policy(folder_id: &str, folder_path: &str, destinations: &[&str]) -> FolderPolicy {
        FolderPolicy {
            folder_id: folder_id.to_string(),
            folder_path: folder_path.to_string(),
            destinations: destinations.iter().map(|s| s.to_string()).collect(),
            recursive: true,
            enabled: true,
        }
    }

    #[test]
    fn plan_queue_routes_and_counts_untracked() {
        let policies = vec![policy("p1", "/Docs", &["s3-us", "b2-eu"])];
        let files = vec![
            remote_file("f1", "/Docs/report.txt", 10),
            remote_file("f2", "/Music/track.mp3", 20),
        ];

        let (queued, untracked) = plan_queue(files, &policies);

        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].file.id, "f1");
        assert_eq!(queued[0].destination_ids, vec!["s3-us", "b2-eu"]);
        assert_eq!(untracked, 1);
    }

    #[test]
    fn plan_queue_routes_each_file_to_its_own_policy() {
        let policies = vec![
            policy("p1", "/Docs", &["s3-us"]),
            policy("p2", "/Photos", &["b2-eu"]),
        ];
        let files = vec![
            remote_file("f1", "/Docs/report.txt", 10),
            remote_file("f2", "/Photos/cat.jpg", 20),
        ];

        let (queued, untracked) = plan_queue(files, &policies);

        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].destination_ids, vec!["s3-us"]);
        assert_eq!(queued[1].destination_ids, vec!["b2-eu"]);
        assert_eq!(untracked, 0);
    }

    #[test]
    fn group_due_retries_merges_per_file() {
        let entries = vec![
            RetryEntry {
                file_id: "f1".to_string(),
                destination_id: "s3-us".to_string(),
                attempt: 1,
                next_eligible_at: 0,
            },
            RetryEntry {
                file_id: "f2".to_string(),
                destination_id: "s3-us".to_string(),
                attempt: 2,
                next_eligible_at: 0,
            },
            RetryEntry {
                file_id: "f1".to_string(),
                destination_id: "b2-eu".to_string(),
                attempt: 1,
                next_eligible_at: 0,
            },
        ];

        let grouped = group_due_retries(&entries);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "f1");
        assert_eq!(grouped[0].1, vec!["s3-us", "b2-eu"]);
        assert_eq!(grouped[1].0, "f2");
        assert_eq!(grouped[1].1, vec!["s3-us"]);
    }

    #[test]
    fn tally_accumulates_outcomes() {
        let mut stats = CycleStats::default();
        tally(
            TaskResult {
                file_id: "f1".to_string(),
                outcome: Ok(FileOutcome::Synced {
                    transferred: 2,
                    skipped: 0,
                    bytes_transferred: 100,
                }),
            },
            &mut stats,
        );
        tally(
            TaskResult {
                file_id: "f2".to_string(),
                outcome: Ok(FileOutcome::DownloadFailed {
                    error: "short read".to_string(),
                }),
            },
            &mut stats,
        );

        assert_eq!(stats.files_synced, 1);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.bytes_transferred, 100);
        assert_eq!(stats.last_error.as_deref(), Some("short read"));
    }
}
