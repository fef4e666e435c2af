//! Retrieval Coordinator
//!
//! Drains the batch queue and stages every request through the archive
//! primitives. At most one drain runs at a time per coordinator.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use super::queue::{BatchRetrievalQueue, RetrievalRequest, Ticket};
use crate::ecfs::{ArchivePrimitives, EcfsError};

/// Serializes batch drains over a shared request queue
pub struct RetrievalCoordinator {
    /// Pending requests from all attached handles
    queue: BatchRetrievalQueue,
    /// Held for the whole duration of a drain
    drain_lock: Mutex<()>,
    /// Archive access
    primitives: Arc<dyn ArchivePrimitives>,
    /// Drains that staged at least one request
    drains: AtomicU64,
}

impl RetrievalCoordinator {
    /// Create a coordinator staging through `primitives`
    pub fn new(primitives: Arc<dyn ArchivePrimitives>) -> Self {
        Self {
            queue: BatchRetrievalQueue::new(),
            drain_lock: Mutex::new(()),
            primitives,
            drains: AtomicU64::new(0),
        }
    }

    /// Queue a request for the next drain
    pub fn enqueue(&self, request: RetrievalRequest) -> Ticket {
        self.queue.enqueue(request)
    }

    /// The request queue
    pub fn queue(&self) -> &BatchRetrievalQueue {
        &self.queue
    }

    /// Archive primitives used for staging
    pub fn primitives(&self) -> &Arc<dyn ArchivePrimitives> {
        &self.primitives
    }

    /// Number of drains that found work, failed ones included
    pub fn drain_count(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    /// Stage every request queued before this call took its snapshot
    ///
    /// Returns immediately when the queue is empty. On the first failed
    /// copy the whole queue is purged, the failure is recorded against every
    /// ticket of the batch and the purged ones, and the error is returned.
    pub fn drain_and_stage(&self) -> Result<(), EcfsError> {
        let boundary = {
            let _guard = self.drain_lock.lock().unwrap();

            if self.queue.is_empty() {
                debug!("Retrieval queue empty, nothing to stage");
                return Ok(());
            }

            self.queue.push_boundary();
            let batch = self.queue.take_batch();
            let (Some(&(first_ticket, _)), Some(&(last_ticket, _))) = (batch.first(), batch.last())
            else {
                return Ok(());
            };

            let drain = self.drains.fetch_add(1, Ordering::Relaxed) + 1;
            info!(drain = drain, count = batch.len(), "Staging batch from archive");
            if let Err(e) = self.stage_batch(&batch) {
                let discarded = self.queue.fail_batch(first_ticket, last_ticket, e.to_string());
                error!(error = %e, discarded = discarded, "Batch staging failed, queue purged");
                return Err(e);
            }

            self.queue.mark_consumed(last_ticket);
            last_ticket
        };

        self.queue.wait_consumed(boundary);
        debug!(through = boundary, "Batch staging complete");
        Ok(())
    }

    fn stage_batch(&self, batch: &[(Ticket, RetrievalRequest)]) -> Result<(), EcfsError> {
        for (ticket, request) in batch {
            let local_path = request.local_path();
            debug!(ticket = ticket, remote = %request.remote_path, "Retrieving file");
            self.primitives.copy(&request.remote_path, &local_path)?;
            apply_permissions(&local_path, request.permissions)?;
        }
        Ok(())
    }
}

fn apply_permissions(path: &Path, mode: u32) -> Result<(), EcfsError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::testing::ScriptedArchive;
    use std::path::PathBuf;

    fn request(cache: &Path, remote: &str) -> RetrievalRequest {
        let relative = remote.trim_start_matches('/');
        let destination_dir = cache.join(relative).parent().unwrap().to_path_buf();
        RetrievalRequest {
            remote_path: remote.to_string(),
            destination_dir,
            permissions: 0o640,
        }
    }

    #[test]
    fn test_empty_queue_is_noop() {
        let archive = ScriptedArchive::new();
        let coordinator = RetrievalCoordinator::new(archive.clone());
        coordinator.drain_and_stage().unwrap();
        assert!(archive.copies().is_empty());
    }

    #[test]
    fn test_drain_stages_in_fifo_order_with_permissions() {
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "one"), ("/a/2.dat", "two")]);
        let cache = tempfile::tempdir().unwrap();
        let coordinator = RetrievalCoordinator::new(archive.clone());

        coordinator.enqueue(request(cache.path(), "/a/2.dat"));
        coordinator.enqueue(request(cache.path(), "/a/1.dat"));
        coordinator.drain_and_stage().unwrap();

        assert_eq!(archive.copied_paths(), vec!["/a/2.dat", "/a/1.dat"]);
        let staged = cache.path().join("a/1.dat");
        assert_eq!(fs::read_to_string(&staged).unwrap(), "one");
        let mode = fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        assert!(coordinator.queue().is_empty());
        assert_eq!(coordinator.queue().consumed(), 2);
    }

    #[test]
    fn test_duplicates_are_copied_twice() {
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "one")]);
        let cache = tempfile::tempdir().unwrap();
        let coordinator = RetrievalCoordinator::new(archive.clone());

        coordinator.enqueue(request(cache.path(), "/a/1.dat"));
        coordinator.enqueue(request(cache.path(), "/a/1.dat"));
        coordinator.drain_and_stage().unwrap();

        assert_eq!(archive.copied_paths(), vec!["/a/1.dat", "/a/1.dat"]);
    }

    #[test]
    fn test_failure_purges_queue_and_propagates() {
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "one"), ("/a/3.dat", "three")]);
        archive.fail_on("/a/2.dat");
        let cache = tempfile::tempdir().unwrap();
        let coordinator = RetrievalCoordinator::new(archive.clone());

        coordinator.enqueue(request(cache.path(), "/a/1.dat"));
        coordinator.enqueue(request(cache.path(), "/a/2.dat"));
        coordinator.enqueue(request(cache.path(), "/a/3.dat"));

        let err = coordinator.drain_and_stage().unwrap_err();
        assert!(matches!(err, EcfsError::RetrievalFailed(_)));
        assert!(coordinator.queue().is_empty());
        assert_eq!(coordinator.queue().consumed(), 3);
        assert!(!cache.path().join("a/3.dat").exists());
        for ticket in 1..=3 {
            assert!(coordinator.queue().failure_for(ticket).is_some());
        }

        // The next batch is not poisoned by the failed one
        coordinator.enqueue(request(cache.path(), "/a/3.dat"));
        coordinator.drain_and_stage().unwrap();
        assert!(cache.path().join("a/3.dat").exists());
        assert_eq!(
            archive.copied_paths(),
            vec!["/a/1.dat", "/a/2.dat", "/a/3.dat"]
        );
    }

    #[test]
    fn test_request_local_path_mirrors_archive() {
        let req = request(Path::new("/cache"), "/x/y/z.grb");
        assert_eq!(req.local_path(), PathBuf::from("/cache/x/y/z.grb"));
    }
}
