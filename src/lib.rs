//! # Hivecore - Key Cache and Hive Lifetime Management
//!
//! `hivecore` is the in-memory core of a hierarchical configuration store.
//! Keys live in hives mounted under a single namespace, and every open key
//! is backed by a reference-counted key control block (KCB) in a hashed
//! cache. The crate provides:
//!
//! - **Multi-granularity locking**: a global registry lock (shared, shared
//!   starving writers, recursive exclusive) over hashed bucket locks
//! - **KCB cache** with parent references and a delayed-close reuse cache
//! - **Extent reclamation**: freeing the tail of a hive's storage with quota
//!   accounting and dirty-vector maintenance
//! - **Late unload**: freeze a busy hive and unload it from a background
//!   worker once its last handle closes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hivecore::{HiveSpec, Registry, RegistryConfig, Result, UnloadOutcome};
//!
//! # fn main() -> Result<()> {
//! let registry = Registry::new(RegistryConfig::default())?;
//! let spec = HiveSpec::new("SOFTWARE").with_keys(["Vendor\\App"]);
//! registry.load_hive("\\Registry\\Machine\\Software", &spec)?;
//!
//! let root = registry.open_key("\\Registry\\Machine\\Software")?;
//! let app = registry.open_key("\\Registry\\Machine\\Software\\Vendor\\App")?;
//! let settings = registry.create_key(&app, "Settings")?;
//!
//! // app and settings are still open, so the hive freezes
//! assert_eq!(registry.unload_hive_late(&root)?, UnloadOutcome::Pending);
//! drop(root);
//! drop(settings);
//! drop(app); // last close queues the unload
//!
//! registry.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use hivecore::{Registry, RegistryConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let config = RegistryConfig::from_toml_str(
//!     r#"
//!     hash_table_size = 1024
//!     delay_close_size = 0
//!     "#,
//! )?;
//! let registry = Registry::new(config)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    allocator::{quota::QuotaPool, HiveHysteresis, SizeTracker},
    config::RegistryConfig,
    error::{HiveError, Result, UnloadError},
    hive::{CellIndex, Hive, HiveId, HiveSpec, HiveState, StorageKind},
    kcb::{name::ConvKey, KcbRef},
    key_body::{BodyKind, CloseNotifier, KeyBody, KeyHandle, NoopNotifier},
    lock::{Flusher, RegistryLock},
    registry::{Registry, RegistryBuilder, RegistryStats, UnloadOutcome},
    workqueue::{ManualQueue, TaskQueue, WorkQueue},
};
