use tokio::sync::{mpsc, oneshot};

use crate::state::{FileDestinationRecord, StatusCounts};

/// Observable run state of the daemon loop, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopping,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
        }
    }
}

/// Counters accumulated since the daemon started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles_completed: u64,
    pub files_synced: u64,
    pub files_failed: u64,
    pub files_untracked: u64,
    pub bytes_transferred: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub run_state: RunState,
    pub uptime: std::time::Duration,
    pub destinations: Vec<StatusCounts>,
    pub retry_queue_len: i64,
    pub staging_used_bytes: u64,
    pub staging_quota_bytes: u64,
    pub stats: CycleStats,
}

#[derive(Debug)]
pub enum DaemonCommand {
    Stop,
    Pause,
    Resume,
    /// Starts a discovery cycle immediately, or pushes one specific file
    /// through the pipeline by id.
    ForceSync(Option<String>),
    Status(oneshot::Sender<DaemonStatus>),
    ListFailed(oneshot::Sender<Vec<FileDestinationRecord>>),
    /// Operator reset of a terminal failure back to Pending.
    Retry {
        file_id: String,
        destination_id: String,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("daemon is not running")]
pub struct ControlError;

/// Cloneable handle for driving a running daemon loop.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonCommand>,
}

impl DaemonHandle {
    pub fn new(tx: mpsc::Sender<DaemonCommand>) -> Self {
        Self { tx }
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.send(DaemonCommand::Stop).await
    }

    pub async fn pause(&self) -> Result<(), ControlError> {
        self.send(DaemonCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        self.send(DaemonCommand::Resume).await
    }

    pub async fn force_sync(&self, file_id: Option<String>) -> Result<(), ControlError> {
        self.send(DaemonCommand::ForceSync(file_id)).await
    }

    pub async fn status(&self) -> Result<DaemonStatus, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(DaemonCommand::Status(reply)).await?;
        rx.await.map_err(|_| ControlError)
    }

    pub async fn list_failed(&self) -> Result<Vec<FileDestinationRecord>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(DaemonCommand::ListFailed(reply)).await?;
        rx.await.map_err(|_| ControlError)
    }

    pub async fn retry(
        &self,
        file_id: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Result<bool, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(DaemonCommand::Retry {
            file_id: file_id.into(),
            destination_id: destination_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ControlError)
    }

    async fn send(&self, command: DaemonCommand) -> Result<(), ControlError> {
        self.tx.send(command).await.map_err(|_| ControlError)
    }
}
