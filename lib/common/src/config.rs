//! Various configuration parameters and identifier types for the undo
//! subsystem.

use ::config::{ConfigBuilder, Environment, File, FileFormat};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use shrinkwraprs::Shrinkwrap;
use std::fmt;
use thiserror::Error;
use tracing::warn;
use typed_builder::TypedBuilder;

/// The maximum number of concurrent sessions. Every session can have at most
/// one transaction in flight, so this bounds the number of transactions that
/// may simultaneously need undo bookkeeping.
pub const MAX_SESSIONS: usize = 100;

/// Default capacity of the undo request arena: one slot per session, because
/// a request must be allocated before a transaction writes any undo.
pub const DEFAULT_UNDO_CAPACITY: usize = MAX_SESSIONS;

/// Default utilization threshold beyond which aborting transactions must
/// apply their own undo instead of queueing it for background workers.
pub const DEFAULT_UNDO_SOFT_LIMIT: usize = MAX_SESSIONS - MAX_SESSIONS / 4;

/// Full (epoch-extended) transaction identifier. Unlike a plain transaction
/// id, it never wraps around, so values are comparable across the lifetime
/// of the cluster. Zero is the invalid sentinel.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Shrinkwrap,
)]
pub struct FullTransactionId(pub u64);

impl FullTransactionId {
    pub const INVALID: FullTransactionId = FullTransactionId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for FullTransactionId {
    fn from(fxid: u64) -> Self {
        Self(fxid)
    }
}

impl From<FullTransactionId> for u64 {
    fn from(fxid: FullTransactionId) -> Self {
        fxid.0
    }
}

impl fmt::Display for FullTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fxid({})", self.0)
    }
}

/// Unique identifier for a database. Zero is the invalid sentinel; filters
/// use it to mean "any database".
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Shrinkwrap,
)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    pub const INVALID: DatabaseId = DatabaseId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for DatabaseId {
    fn from(dbid: u32) -> Self {
        Self(dbid)
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({})", self.0)
    }
}

/// Opaque position in the undo log. The undo machinery only ever compares
/// these for equality and validity; interpreting one is the log's business.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Shrinkwrap,
)]
pub struct UndoRecPtr(pub u64);

impl UndoRecPtr {
    pub const INVALID: UndoRecPtr = UndoRecPtr(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for UndoRecPtr {
    fn from(ptr: u64) -> Self {
        Self(ptr)
    }
}

impl fmt::Display for UndoRecPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UndoRecPtr({:#x})", self.0)
    }
}

/// Wall-clock timestamp in milliseconds since the UNIX epoch.
///
/// `NEVER_BEGIN` sorts before every reachable time and marks retry deadlines
/// that have never been scheduled.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const NEVER_BEGIN: Timestamp = Timestamp(i64::MIN);

    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    pub fn is_never_begin(&self) -> bool {
        *self == Self::NEVER_BEGIN
    }

    pub fn plus_millis(self, millis: i64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }
}

#[derive(Debug, Error, Clone)]
pub enum UndoConfigError {
    #[error("Invalid configuration")]
    InvalidConfig,
    #[error("undo request capacity must be nonzero")]
    ZeroCapacity,
}

/// Tunables for the undo request manager. Both knobs are fixed at
/// construction time; there is no online resizing.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct UndoManagerConfig {
    /// Hard upper bound on concurrently tracked undo requests.
    pub capacity: usize,
    /// Utilization threshold above which non-forced background admission is
    /// refused.
    pub soft_size_limit: usize,
}

impl Default for UndoManagerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_UNDO_CAPACITY,
            soft_size_limit: DEFAULT_UNDO_SOFT_LIMIT,
        }
    }
}

impl UndoManagerConfig {
    /// Load configuration from a TOML file (optional) and the environment.
    /// Environment variables use the `URM` prefix, e.g. `URM__CAPACITY`.
    pub fn load_from_file_and_env(file_path: &str) -> Result<Self, UndoConfigError> {
        let builder = ConfigBuilder::<::config::builder::DefaultState>::default()
            .set_default("capacity", DEFAULT_UNDO_CAPACITY as i64)
            .map_err(|_| UndoConfigError::InvalidConfig)?
            .set_default("soft_size_limit", DEFAULT_UNDO_SOFT_LIMIT as i64)
            .map_err(|_| UndoConfigError::InvalidConfig)?
            .add_source(File::new(file_path, FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("URM").separator("__"))
            .build()
            .map_err(|_| UndoConfigError::InvalidConfig)?;

        let config = builder
            .try_deserialize::<UndoManagerConfig>()
            .map_err(|_| UndoConfigError::InvalidConfig)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), UndoConfigError> {
        if self.capacity == 0 {
            return Err(UndoConfigError::ZeroCapacity);
        }
        if self.soft_size_limit > self.capacity {
            // Harmless, but the limit can then never refuse anything.
            warn!(
                soft_size_limit = self.soft_size_limit,
                capacity = self.capacity,
                "soft size limit exceeds capacity and will never apply"
            );
        }
        Ok(())
    }
}
