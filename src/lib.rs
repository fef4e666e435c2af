//! Batched staging of tape archive files
//!
//! Files opened close together are retrieved from the ECFS archive in one
//! batch into a local cache and read from there. The same machinery backs a
//! read-only FUSE mount of archive directories.

pub mod config;
pub mod ecfs;
pub mod fs;
pub mod mount;
pub mod stage;

pub use config::{ArchiveScheme, StageConfig};
pub use ecfs::{ArchivePrimitives, EcfsClient, EcfsError};
pub use fs::ArchiveCatalog;
pub use stage::{CachedFileHandle, DirectoryListingCache, RetrievalCoordinator, StagingPolicy};
