//! ECFS tape archive client

pub mod client;
pub mod errors;
pub mod types;

pub use client::{ArchivePrimitives, EcfsClient};
pub use errors::{io_errno, EcfsError};
pub use types::*;
