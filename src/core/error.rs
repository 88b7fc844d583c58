//! Error types for registry operations

use thiserror::Error;

use crate::core::hive::{CellIndex, HiveId};

/// Registry operation errors
#[derive(Error, Debug)]
pub enum HiveError {
    /// No key at this path
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A key already exists at this path
    #[error("Key already exists: {0}")]
    KeyExists(String),

    /// Only leaf keys can be deleted
    #[error("Key has subkeys and cannot be deleted: {0}")]
    HasSubkeys(String),

    /// Handle refers to a key deleted while it was open
    #[error("Key has been deleted")]
    KeyDeleted,

    /// Empty component, separator in a name, or name too long
    #[error("Invalid key name: {0}")]
    InvalidKeyName(String),

    /// Path is not under any mounted hive
    #[error("No hive mounted for path: {0}")]
    NoHiveMounted(String),

    /// Another active hive is mounted at this path
    #[error("Mount path already in use: {0}")]
    MountConflict(String),

    /// Hive is frozen or already unmounted
    #[error("Hive {0:?} is being unloaded")]
    HiveUnloading(HiveId),

    /// Key node reached the configured reference limit
    #[error("Reference count limit reached for key: {0}")]
    RefCountOverflow(String),

    /// Global quota or space limit would be exceeded
    #[error("Quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// Cell does not name a usable bin or boundary
    #[error("Invalid cell index: {0:?}")]
    InvalidCell(CellIndex),

    /// Hive unload refused
    #[error("Unload failed: {0}")]
    Unload(#[from] UnloadError),

    /// Work queue refused a task
    #[error("Task queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text is not valid TOML for this schema
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Statuses a hive unload can report
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadError {
    /// Something besides the caller still references the hive
    #[error("hive still has open references")]
    CannotDelete,

    /// Handle is not on the root of an unloadable hive
    #[error("key is not the root of an unloadable hive")]
    InvalidParameter,

    /// Hive is frozen or has an unload pending
    #[error("an unload is already pending for this hive")]
    TooLate,
}

/// Registry operation result type
pub type Result<T> = std::result::Result<T, HiveError>;
