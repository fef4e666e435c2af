//! Directory Listing Cache
//!
//! Append-only cache of recursive archive listings using Moka.
//! Entries never expire: changes made to the archive by other users are only
//! seen after a restart.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use tracing::{debug, trace};

use crate::ecfs::{is_within, ListingEntry};

/// Recursive listings keyed by the path they were taken at
pub struct DirectoryListingCache {
    /// Listing root -> every entry below it
    listings: Cache<String, Arc<Vec<ListingEntry>>>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl DirectoryListingCache {
    pub fn new() -> Self {
        Self {
            listings: Cache::builder().name("archive_listing_cache").build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached entries at or below `path`
    ///
    /// Non-recursive queries always miss: a recursive listing cannot tell
    /// whether a directory has entries it was not asked about. A recursive
    /// query collects every cached entry at or below `path`, whichever
    /// listing it was stored under.
    pub fn lookup(&self, path: &str, recursive: bool) -> Option<Vec<ListingEntry>> {
        if !recursive {
            return None;
        }

        let path = normalize(path);
        let mut roots: Vec<(Arc<String>, Arc<Vec<ListingEntry>>)> = self.listings.iter().collect();
        roots.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for (_, entries) in &roots {
            for entry in entries.iter().filter(|e| is_within(&e.path, &path)) {
                if seen.insert(entry.path.clone()) {
                    found.push(entry.clone());
                }
            }
        }

        if found.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(path = %path, "Cache MISS for listing");
            None
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(path = %path, entries = found.len(), "Cache HIT for listing");
            Some(found)
        }
    }

    /// Remember a listing; only recursive listings are kept
    pub fn store(&self, path: &str, entries: &[ListingEntry], recursive: bool) {
        if !recursive {
            return;
        }
        let path = normalize(path);
        debug!(path = %path, entries = entries.len(), "Cached recursive listing");
        self.listings.insert(path, Arc::new(entries.to_vec()));
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let (hits, misses) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            listings = self.listings.entry_count(),
            "Listing cache metrics"
        );
    }
}

impl Default for DirectoryListingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> ListingEntry {
        ListingEntry {
            permissions: "-rw-r--r--".to_string(),
            links: 1,
            owner: "u".to_string(),
            group: "g".to_string(),
            size: 1,
            modified: "Jan 01 00:00".to_string(),
            path: path.to_string(),
        }
    }

    fn paths(entries: &[ListingEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_non_recursive_never_cached() {
        let cache = DirectoryListingCache::new();
        cache.store("/a", &[entry("/a/1.dat")], false);
        assert!(cache.lookup("/a", true).is_none());
        assert!(cache.lookup("/a", false).is_none());
    }

    #[test]
    fn test_recursive_hit_and_descendant_filter() {
        let cache = DirectoryListingCache::new();
        cache.store(
            "/a/",
            &[entry("/a/1.dat"), entry("/a/b"), entry("/a/b/2.dat"), entry("/a/bc.dat")],
            true,
        );

        let all = cache.lookup("/a", true).unwrap();
        assert_eq!(all.len(), 4);

        let sub = cache.lookup("/a/b", true).unwrap();
        assert_eq!(paths(&sub), vec!["/a/b", "/a/b/2.dat"]);

        // Descendants still need a fresh fetch for non-recursive queries
        assert!(cache.lookup("/a/b", false).is_none());
        assert_eq!(cache.stats(), (2, 0));
    }

    #[test]
    fn test_listing_below_path_answers_parent() {
        let cache = DirectoryListingCache::new();
        cache.store("/a/b", &[entry("/a/b/2.dat")], true);

        let found = cache.lookup("/a", true).unwrap();
        assert_eq!(paths(&found), vec!["/a/b/2.dat"]);
        assert!(cache.lookup("/x", true).is_none());
        assert!(cache.lookup("/a/bc", true).is_none());
        assert_eq!(cache.stats(), (1, 2));
    }

    #[test]
    fn test_sibling_listings_are_merged() {
        let cache = DirectoryListingCache::new();
        cache.store("/a/c", &[entry("/a/c"), entry("/a/c/4.dat")], true);
        cache.store("/a/b", &[entry("/a/b"), entry("/a/b/2.dat")], true);

        let found = cache.lookup("/a", true).unwrap();
        assert_eq!(paths(&found), vec!["/a/b", "/a/b/2.dat", "/a/c", "/a/c/4.dat"]);
        assert_eq!(paths(&cache.lookup("/", true).unwrap()).len(), 4);
    }

    #[test]
    fn test_overlapping_listings_are_deduplicated() {
        let cache = DirectoryListingCache::new();
        cache.store("/a", &[entry("/a/b"), entry("/a/b/2.dat")], true);
        cache.store("/a/b", &[entry("/a/b"), entry("/a/b/2.dat"), entry("/a/b/3.dat")], true);

        let sub = cache.lookup("/a/b", true).unwrap();
        assert_eq!(paths(&sub), vec!["/a/b", "/a/b/2.dat", "/a/b/3.dat"]);
    }
}
