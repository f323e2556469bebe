//! replica-daemon library: exposes the daemon components for testing.
//!
//! A thin layer over the native adapters of the sync core, so integration
//! tests can drive the same pieces the binary wires together.

pub mod config;
pub mod daemon;
pub mod dir_store;
pub mod file_slot;
pub mod persistence;

pub use config::load_config;
pub use daemon::{Daemon, DaemonOptions};
pub use dir_store::DirStore;
pub use file_slot::FileSlot;
pub use persistence::JsonStateStore;
