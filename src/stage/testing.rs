//! In-memory archive used by the staging tests

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::ecfs::{is_within, ArchivePrimitives, EcfsError, ListingEntry};

/// Archive whose files live in memory and whose calls are recorded
#[derive(Default)]
pub struct ScriptedArchive {
    files: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    copies: Mutex<Vec<(String, PathBuf)>>,
    copy_threads: Mutex<Vec<ThreadId>>,
    lists: Mutex<Vec<(String, bool)>>,
}

impl ScriptedArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_files(files: &[(&str, &str)]) -> Arc<Self> {
        let archive = Self::default();
        {
            let mut map = archive.files.lock().unwrap();
            for (path, content) in files {
                map.insert(path.to_string(), content.to_string());
            }
        }
        Arc::new(archive)
    }

    /// Make every copy of `path` fail
    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn copies(&self) -> Vec<(String, PathBuf)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn copied_paths(&self) -> Vec<String> {
        self.copies().into_iter().map(|(remote, _)| remote).collect()
    }

    /// Thread that made each copy, in call order
    pub fn copy_threads(&self) -> Vec<ThreadId> {
        self.copy_threads.lock().unwrap().clone()
    }

    /// Recorded `(path, recursive)` list calls
    pub fn lists(&self) -> Vec<(String, bool)> {
        self.lists.lock().unwrap().clone()
    }

    fn file_entry(path: &str, size: usize) -> ListingEntry {
        ListingEntry {
            permissions: "-rw-r--r--".to_string(),
            links: 1,
            owner: "archive".to_string(),
            group: "users".to_string(),
            size: size as u64,
            modified: "Jan 01 00:00".to_string(),
            path: path.to_string(),
        }
    }

    fn dir_entry(path: &str) -> ListingEntry {
        ListingEntry {
            permissions: "drwxr-xr-x".to_string(),
            size: 0,
            ..Self::file_entry(path, 0)
        }
    }
}

impl ArchivePrimitives for ScriptedArchive {
    fn list(
        &self,
        path: &str,
        _detail: bool,
        recursive: bool,
    ) -> Result<Vec<ListingEntry>, EcfsError> {
        self.lists.lock().unwrap().push((path.to_string(), recursive));
        let files = self.files.lock().unwrap();

        if let Some(content) = files.get(path) {
            return Ok(vec![Self::file_entry(path, content.len())]);
        }

        let root = path.trim_end_matches('/');
        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        let mut names: Vec<&String> = files.keys().filter(|p| is_within(p, root)).collect();
        names.sort();

        for file in names {
            let relative = file[root.len()..].trim_start_matches('/');
            let components: Vec<&str> = relative.split('/').collect();
            if recursive {
                let mut dir = root.to_string();
                for component in &components[..components.len() - 1] {
                    dir = format!("{}/{}", dir, component);
                    if dirs.insert(dir.clone()) {
                        entries.push(Self::dir_entry(&dir));
                    }
                }
                entries.push(Self::file_entry(file, files[file].len()));
            } else if components.len() == 1 {
                entries.push(Self::file_entry(file, files[file].len()));
            } else {
                let dir = format!("{}/{}", root, components[0]);
                if dirs.insert(dir.clone()) {
                    entries.push(Self::dir_entry(&dir));
                }
            }
        }

        if entries.is_empty() {
            return Err(EcfsError::NotFound(path.to_string()));
        }
        Ok(entries)
    }

    fn copy(&self, remote_path: &str, local_path: &Path) -> Result<(), EcfsError> {
        self.copies
            .lock()
            .unwrap()
            .push((remote_path.to_string(), local_path.to_path_buf()));
        self.copy_threads.lock().unwrap().push(thread::current().id());

        if self.failing.lock().unwrap().contains(remote_path) {
            return Err(EcfsError::RetrievalFailed(format!("{}: tape read error", remote_path)));
        }
        let content = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| EcfsError::NotFound(remote_path.to_string()))?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(local_path, content)?;
        Ok(())
    }
}
