//! Mount lifecycle

pub mod manager;

pub use manager::MountManager;
