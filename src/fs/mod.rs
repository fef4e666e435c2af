//! Filesystem interface: catalog facade and FUSE implementation

pub mod archivefs;
pub mod catalog;
pub mod handles;
pub mod inode;

pub use archivefs::ArchiveFilesystem;
pub use catalog::ArchiveCatalog;
pub use handles::HandleTable;
pub use inode::InodeTable;
