use tracing::warn;

use crate::dest::Destination;

/// Decides whether (file, destination) needs a transfer.
///
/// A remote object at the mapped path with exactly the declared byte size
/// means the transfer is skipped. Identity is path + size only; no hashing.
/// A genuine adapter error (anything but "not found") fails open: the
/// transfer proceeds rather than risking a missed backup.
pub async fn transfer_needed(dest: &Destination, remote_path: &str, size: u64) -> bool {
    match dest.stat(remote_path).await {
        Ok(Some(remote_size)) => remote_size != size,
        Ok(None) => true,
        Err(err) => {
            warn!(
                destination = dest.id(),
                remote_path,
                error = %err,
                "existence check failed, assuming transfer needed"
            );
            true
        }
    }
}
