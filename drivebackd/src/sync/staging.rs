use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::sync::transfer::partial_path;

/// Admission-controlled staging directory. A file is only admitted into
/// downloading when its declared size fits under the byte quota; the lease
/// returns that capacity when the run settles. Total staged bytes never
/// exceed the quota.
#[derive(Clone)]
pub struct StagingArea {
    root: PathBuf,
    quota_bytes: u64,
    used: Arc<AtomicU64>,
}

impl StagingArea {
    pub fn new(root: PathBuf, quota_bytes: u64) -> Self {
        Self {
            root,
            quota_bytes,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// True when the file can never be staged, regardless of current load.
    pub fn exceeds_quota(&self, size: u64) -> bool {
        size > self.quota_bytes
    }

    /// Tries to reserve staging capacity for one file. `None` is the
    /// backpressure signal: the caller leaves the file Pending and tries
    /// again after a Settling event frees capacity.
    pub fn try_admit(&self, file_id: &str, size: u64) -> Option<StagingLease> {
        if size > self.quota_bytes {
            return None;
        }
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            if current + size > self.quota_bytes {
                return None;
            }
            match self.used.compare_exchange(
                current,
                current + size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(StagingLease {
            path: self.root.join(sanitize_file_name(file_id)),
            size,
            used: Arc::clone(&self.used),
        })
    }
}

/// One staged artifact's reservation. The artifact lives only for the
/// pipeline run that owns the lease; dropping the lease deletes the file and
/// returns the reserved bytes.
pub struct StagingLease {
    path: PathBuf,
    size: u64,
    used: Arc<AtomicU64>,
}

impl StagingLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingLease {
    fn drop(&mut self) {
        // A cancelled download can leave the in-progress sibling behind, so
        // both the artifact and its partial are swept here.
        for path in [self.path.clone(), partial_path(&self.path)] {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %err, "staging cleanup failed");
                }
            }
        }
        self.used.fetch_sub(self.size, Ordering::SeqCst);
    }
}

fn sanitize_file_name(file_id: &str) -> String {
    file_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            c
        } else {
            '_'
        })
        .collect()
}
