//! Archive Catalog
//!
//! Filesystem-style access to the archive: listings through the directory
//! listing cache, file opens through the shared retrieval coordinator.

use std::sync::Arc;

use tracing::debug;

use crate::config::StageConfig;
use crate::ecfs::{is_within, ArchivePrimitives, EcfsClient, EcfsError, EntryKind, FileInfo};
use crate::stage::{CachedFileHandle, DirectoryListingCache, RetrievalCoordinator};

/// Entry point for listing and opening archive paths
pub struct ArchiveCatalog {
    config: StageConfig,
    primitives: Arc<dyn ArchivePrimitives>,
    coordinator: Arc<RetrievalCoordinator>,
    listings: DirectoryListingCache,
}

impl ArchiveCatalog {
    /// Create a catalog backed by the archive command line tools
    pub fn from_config(config: StageConfig) -> Self {
        let client = EcfsClient::with_tools(&config.list_tool, &config.copy_tool, config.max_retries);
        Self::new(config, Arc::new(client))
    }

    /// Create a catalog with its own coordinator over `primitives`
    pub fn new(config: StageConfig, primitives: Arc<dyn ArchivePrimitives>) -> Self {
        let coordinator = Arc::new(RetrievalCoordinator::new(Arc::clone(&primitives)));
        Self {
            config,
            primitives,
            coordinator,
            listings: DirectoryListingCache::new(),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RetrievalCoordinator> {
        &self.coordinator
    }

    pub fn listings(&self) -> &DirectoryListingCache {
        &self.listings
    }

    /// List `path`
    ///
    /// Recursive listings are served from and stored in the listing cache;
    /// non-recursive listings always go to the archive. Without `detail`
    /// only names are returned.
    pub fn ls(&self, path: &str, detail: bool, recursive: bool) -> Result<Vec<FileInfo>, EcfsError> {
        let scheme = self.config.scheme;
        let remote = scheme.remote_path(path);

        let cached = if recursive {
            self.listings.lookup(&remote, true)
        } else {
            None
        };
        let entries = match cached {
            Some(entries) => entries,
            None => {
                let entries = self.primitives.list(&remote, true, recursive)?;
                self.listings.store(&remote, &entries, recursive);
                entries
            }
        };

        debug!(path = path, count = entries.len(), recursive = recursive, "Listed path");
        Ok(entries
            .iter()
            .map(|entry| {
                let mut info = FileInfo::from_entry(entry, detail);
                info.name = scheme.user_path(&info.name);
                info
            })
            .collect())
    }

    /// Whether `path` can be listed
    pub fn exists(&self, path: &str) -> bool {
        self.ls(path, false, false).is_ok()
    }

    /// Information about the entry at `path` itself
    pub fn info(&self, path: &str) -> Result<FileInfo, EcfsError> {
        let scheme = self.config.scheme;
        let remote = scheme.remote_path(path);
        let user_path = scheme.user_path(&remote);

        if user_path == "/" {
            return Ok(FileInfo {
                name: user_path,
                size: Some(0),
                kind: Some(EntryKind::Directory),
            });
        }

        if let Some(entries) = self.listings.lookup(&remote, true) {
            if let Some(entry) = entries.iter().find(|e| e.path == remote) {
                let mut info = FileInfo::from_entry(entry, true);
                info.name = user_path;
                return Ok(info);
            }
        }

        let parent = match user_path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &user_path[..idx],
        };
        self.ls(parent, true, false)?
            .into_iter()
            .find(|info| info.name == user_path)
            .ok_or(EcfsError::NotFound(user_path))
    }

    /// Owner of `path` from a fresh detailed listing
    pub fn owner(&self, path: &str) -> Result<String, EcfsError> {
        let remote = self.config.scheme.remote_path(path);
        let entries = self.primitives.list(&remote, true, false)?;
        entries
            .into_iter()
            .find(|e| is_within(&e.path, &remote))
            .map(|e| e.owner)
            .ok_or(EcfsError::NotFound(remote))
    }

    /// Open `path` for reading; staging is deferred until the first read
    pub fn open(&self, path: &str, mode: &str) -> Result<CachedFileHandle, EcfsError> {
        let remote = self.config.scheme.remote_path(path);
        CachedFileHandle::open(
            Arc::clone(&self.coordinator),
            &self.config.cache_root,
            &remote,
            mode,
            &self.config.policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveScheme;
    use crate::stage::testing::ScriptedArchive;
    use crate::stage::StagingPolicy;
    use std::io::Read;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    fn config(cache_root: &Path, scheme: ArchiveScheme) -> StageConfig {
        StageConfig {
            cache_root: cache_root.to_path_buf(),
            scheme,
            policy: StagingPolicy {
                delay: Duration::from_millis(0),
                permissions: 0o644,
                ..StagingPolicy::default()
            },
            max_retries: 0,
            list_tool: "els".to_string(),
            copy_tool: "ecp".to_string(),
        }
    }

    fn archive() -> Arc<ScriptedArchive> {
        ScriptedArchive::with_files(&[
            ("/a/1.dat", "one"),
            ("/a/2.dat", "two"),
            ("/a/b/3.dat", "three"),
            ("/TMP/t/x.dat", "temp"),
        ])
    }

    #[test]
    fn test_non_recursive_ls_always_fetches() {
        let archive = archive();
        let cache = tempfile::tempdir().unwrap();
        let catalog = ArchiveCatalog::new(config(cache.path(), ArchiveScheme::Ec), archive.clone());

        let listing = catalog.ls("/a", true, false).unwrap();
        let names: Vec<&str> = listing.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["/a/1.dat", "/a/2.dat", "/a/b"]);
        assert_eq!(listing[2].kind, Some(EntryKind::Directory));
        assert_eq!(listing[0].size, Some(3));

        catalog.ls("/a", true, false).unwrap();
        assert_eq!(archive.lists().len(), 2);
        assert_eq!(catalog.listings().stats(), (0, 0));
    }

    #[test]
    fn test_recursive_ls_is_cached_but_descendant_non_recursive_is_not() {
        let archive = archive();
        let cache = tempfile::tempdir().unwrap();
        let catalog = ArchiveCatalog::new(config(cache.path(), ArchiveScheme::Ec), archive.clone());

        let all = catalog.ls("/a", true, true).unwrap();
        assert_eq!(all.len(), 4);

        let sub = catalog.ls("/a/b", true, true).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(archive.lists(), vec![("/a".to_string(), true)]);

        catalog.ls("/a/b", true, false).unwrap();
        assert_eq!(
            archive.lists(),
            vec![("/a".to_string(), true), ("/a/b".to_string(), false)]
        );
    }

    #[test]
    fn test_plain_ls_drops_detail() {
        let catalog = ArchiveCatalog::new(config(Path::new("/unused"), ArchiveScheme::Ec), archive());
        let listing = catalog.ls("/a", false, false).unwrap();
        assert!(listing.iter().all(|i| i.size.is_none() && i.kind.is_none()));
    }

    #[test]
    fn test_exists_info_and_owner() {
        let catalog = ArchiveCatalog::new(config(Path::new("/unused"), ArchiveScheme::Ec), archive());
        assert!(catalog.exists("/a"));
        assert!(!catalog.exists("/missing"));

        let info = catalog.info("/a/b/3.dat").unwrap();
        assert_eq!(info.size, Some(5));
        assert_eq!(info.kind, Some(EntryKind::File));
        assert!(catalog.info("/a/b").unwrap().is_directory());
        assert!(catalog.info("/").unwrap().is_directory());
        assert!(matches!(catalog.info("/a/nope"), Err(EcfsError::NotFound(_))));

        assert_eq!(catalog.owner("/a/1.dat").unwrap(), "archive");
    }

    #[test]
    fn test_tmp_scheme_maps_paths() {
        let archive = archive();
        let cache = tempfile::tempdir().unwrap();
        let catalog = ArchiveCatalog::new(config(cache.path(), ArchiveScheme::EcTmp), archive.clone());

        let listing = catalog.ls("/t", true, false).unwrap();
        assert_eq!(listing[0].name, "/t/x.dat");
        assert_eq!(archive.lists()[0].0, "/TMP/t");

        let mut handle = catalog.open("/t/x.dat", "r").unwrap();
        assert_eq!(handle.read_text().unwrap(), "temp");
        assert!(cache.path().join("TMP/t/x.dat").exists());
        assert_eq!(archive.copied_paths(), vec!["/TMP/t/x.dat"]);
    }

    #[test]
    fn test_two_threads_stage_in_one_batch() {
        let archive = archive();
        let cache = tempfile::tempdir().unwrap();
        let mut cfg = config(cache.path(), ArchiveScheme::Ec);
        cfg.policy.delay = Duration::from_millis(500);
        let catalog = Arc::new(ArchiveCatalog::new(cfg, archive.clone()));

        // Both opens happen before either batching window closes
        let handles: Vec<_> = ["/a/1.dat", "/a/2.dat"]
            .iter()
            .map(|p| catalog.open(p, "rb").unwrap())
            .collect();

        let readers: Vec<_> = handles
            .into_iter()
            .map(|mut handle| {
                thread::spawn(move || {
                    let mut buf = Vec::new();
                    handle.read_to_end(&mut buf).unwrap();
                    buf
                })
            })
            .collect();
        let mut contents: Vec<Vec<u8>> = readers.into_iter().map(|r| r.join().unwrap()).collect();
        contents.sort();
        assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec()]);

        assert_eq!(archive.copies().len(), 2);
        assert!(cache.path().join("a/1.dat").exists());
        assert!(cache.path().join("a/2.dat").exists());
        assert!(catalog.coordinator().queue().is_empty());

        // One drain, run by whichever reader got there first, made both copies
        assert_eq!(catalog.coordinator().drain_count(), 1);
        let threads = archive.copy_threads();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0], threads[1]);
    }

    #[test]
    fn test_existing_cached_file_needs_no_archive_calls() {
        let archive = archive();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("x.dat"), "local").unwrap();
        let catalog = ArchiveCatalog::new(config(cache.path(), ArchiveScheme::Ec), archive.clone());

        let handle = catalog.open("/x.dat", "rb").unwrap();
        assert!(handle.is_staged());
        assert!(archive.copies().is_empty());
        assert!(archive.lists().is_empty());
    }
}
