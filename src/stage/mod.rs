//! Staging layer
//!
//! Coalesces concurrent file requests into batched archive retrievals and
//! serves reads from the local cache once files are staged.

pub mod coordinator;
pub mod handle;
pub mod listing;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::RetrievalCoordinator;
pub use handle::{mirror_path, CachedFileHandle, OpenMode, StagingPolicy};
pub use listing::DirectoryListingCache;
pub use queue::{BatchRetrievalQueue, RetrievalRequest, Ticket};
