//! Mount Manager - Controls FUSE mount lifecycle
//!
//! Manages mounting, unmounting, and tracking of archive directories as FUSE volumes.

use anyhow::{anyhow, Context, Result};
use fuser::MountOption;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::fs::{ArchiveCatalog, ArchiveFilesystem};

/// Handle to a running mount
struct MountHandle {
    archive_root: String,
    mountpoint: PathBuf,
    /// Background task running the FUSE session
    task: JoinHandle<()>,
}

/// Manages FUSE mounts, keyed by mountpoint
pub struct MountManager {
    mounts: Arc<RwLock<HashMap<PathBuf, MountHandle>>>,
}

impl MountManager {
    /// Create a new mount manager
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Mount an archive directory at the specified path
    ///
    /// # Arguments
    /// * `catalog` - Catalog the filesystem lists and stages through
    /// * `archive_root` - Archive directory shown at the mount root
    /// * `mountpoint` - Path to mount it at
    pub async fn mount(
        &self,
        catalog: Arc<ArchiveCatalog>,
        archive_root: &str,
        mountpoint: PathBuf,
    ) -> Result<()> {
        {
            let mounts = self.mounts.read().await;
            if mounts.contains_key(&mountpoint) {
                return Err(anyhow!("'{}' is already mounted", mountpoint.display()));
            }
        }

        if !catalog.exists(archive_root) {
            return Err(anyhow!("Archive path '{}' cannot be listed", archive_root));
        }

        info!(
            archive = %archive_root,
            mountpoint = %mountpoint.display(),
            "Mounting archive..."
        );

        if !mountpoint.exists() {
            std::fs::create_dir_all(&mountpoint)
                .context("Failed to create mountpoint directory")?;
        }

        let filesystem = ArchiveFilesystem::new(catalog, archive_root);

        let options = vec![
            MountOption::FSName(format!("ecfs:{}", archive_root)),
            MountOption::RO,
            MountOption::NoAtime,
            MountOption::AutoUnmount,
        ];

        let mp = mountpoint.clone();
        let root = archive_root.to_string();

        // fuser is sync
        let task = tokio::task::spawn_blocking(move || {
            info!(archive = %root, "Starting FUSE session...");

            match fuser::mount2(filesystem, &mp, &options) {
                Ok(()) => {
                    info!(archive = %root, "FUSE session ended normally");
                }
                Err(e) => {
                    error!(archive = %root, error = %e, "FUSE session failed");
                }
            }
        });

        // Give the mount a moment to initialize
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        if task.is_finished() {
            return Err(anyhow!("Mount failed to start - check that FUSE is available"));
        }

        let handle = MountHandle {
            archive_root: archive_root.to_string(),
            mountpoint: mountpoint.clone(),
            task,
        };
        self.mounts.write().await.insert(mountpoint, handle);

        info!(archive = %archive_root, "Mount successful");
        Ok(())
    }

    /// Unmount whatever is mounted at `mountpoint`
    pub async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let handle = {
            let mut mounts = self.mounts.write().await;
            mounts.remove(mountpoint)
        };

        let Some(handle) = handle else {
            return Err(anyhow!("'{}' is not mounted", mountpoint.display()));
        };

        info!(
            archive = %handle.archive_root,
            mountpoint = %handle.mountpoint.display(),
            "Unmounting archive..."
        );

        let output = std::process::Command::new("umount")
            .arg(&handle.mountpoint)
            .output();

        match output {
            Ok(output) if output.status.success() => {
                debug!("umount command succeeded");
            }
            Ok(output) => {
                warn!(
                    "umount command failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Err(e) => {
                warn!("Failed to run umount: {}", e);
            }
        }

        let timeout_result =
            tokio::time::timeout(tokio::time::Duration::from_secs(5), handle.task).await;

        match timeout_result {
            Ok(Ok(())) => {
                info!(archive = %handle.archive_root, "Unmount completed");
            }
            Ok(Err(e)) => {
                warn!(archive = %handle.archive_root, error = %e, "Mount task panicked");
            }
            Err(_) => {
                warn!(archive = %handle.archive_root, "Unmount timed out, task may still be running");
            }
        }

        // Clean up mountpoint if empty
        if handle.mountpoint.exists() {
            if let Err(e) = std::fs::remove_dir(&handle.mountpoint) {
                debug!(
                    mountpoint = %handle.mountpoint.display(),
                    error = %e,
                    "Could not remove mountpoint (may not be empty)"
                );
            }
        }

        Ok(())
    }

    /// Unmount everything
    pub async fn unmount_all(&self) {
        let mountpoints: Vec<PathBuf> = {
            let mounts = self.mounts.read().await;
            mounts.keys().cloned().collect()
        };

        for mountpoint in mountpoints {
            if let Err(e) = self.unmount(&mountpoint).await {
                warn!(mountpoint = %mountpoint.display(), error = %e, "Failed to unmount");
            }
        }
    }
}

impl Default for MountManager {
    fn default() -> Self {
        Self::new()
    }
}
