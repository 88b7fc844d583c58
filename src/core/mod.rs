//! Hive core
//!
//! - [`error`] - Error types for registry operations
//! - [`config`] - Runtime tunables, loadable from TOML
//! - [`hive`] - Hive storage: cells, extent map, dirty vector
//! - [`allocator`] - Extent reclamation and quota accounting
//! - [`lock`] - Registry lock and hashed bucket locks
//! - [`kcb`] - Reference-counted key control block cache
//! - [`key_body`] - Per-handle bodies and the handle object
//! - [`unload`] - Deferred unload of frozen hives
//! - [`workqueue`] - Background task queue
//! - [`registry`] - The registry context tying it together

pub mod allocator;
pub mod config;
pub mod error;
pub mod hive;
pub mod kcb;
pub mod key_body;
pub mod lock;
pub mod registry;
pub mod unload;
pub mod workqueue;
