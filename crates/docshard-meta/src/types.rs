use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fully qualified collection name, `db.coll`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub db: String,
    /// Collection name within the database
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace from its database and collection parts
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl FromStr for Namespace {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(MetaError::InvalidNamespace(s.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Identifier of a shard (a replica set holding a subset of chunks)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a new ShardId
    pub fn new(id: impl Into<String>) -> Self {
        ShardId(id.into())
    }

    /// Returns the shard id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one incarnation of a sharded collection.
///
/// A drop/recreate or reshard produces a new epoch, which invalidates every
/// cached chunk map built against the old one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(uuid::Uuid);

impl Epoch {
    /// Generates a fresh random epoch
    pub fn generate() -> Self {
        Epoch(uuid::Uuid::new_v4())
    }

    /// Wraps an existing uuid
    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Epoch(id)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk version: major bumps on ownership change, minor bumps on split
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkVersion {
    /// Incremented when a chunk changes shard
    pub major: u32,
    /// Incremented for each chunk produced by a split
    pub minor: u32,
}

impl ChunkVersion {
    /// Version of the single chunk created by shardCollection
    pub const INITIAL: ChunkVersion = ChunkVersion { major: 1, minor: 0 };

    /// Creates a new ChunkVersion
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Next version within the same major, used for split children
    pub fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    /// First version of the next major, used for migrated chunks
    pub fn next_major(self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// Version of a whole collection's chunk map: its epoch plus the highest chunk version
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionVersion {
    /// Collection incarnation
    pub epoch: Epoch,
    /// Highest chunk version in the collection
    pub version: ChunkVersion,
}

impl CollectionVersion {
    /// Creates a new CollectionVersion
    pub fn new(epoch: Epoch, version: ChunkVersion) -> Self {
        Self { epoch, version }
    }
}

impl fmt::Display for CollectionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}||{}", self.version, self.epoch)
    }
}

/// A shard key value.
///
/// Values of different types order by type first: `MinKey < Int < Str < MaxKey`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKeyValue {
    /// Sorts below every other value
    MinKey,
    /// Integer key
    Int(i64),
    /// String key
    Str(String),
    /// Sorts above every other value
    MaxKey,
}

impl ShardKeyValue {
    /// Key between `a` and `b` (inclusive of `a`), used when a median is ambiguous.
    ///
    /// Integers bisect arithmetically; any other pair falls back to `a`.
    pub fn midpoint(a: &ShardKeyValue, b: &ShardKeyValue) -> ShardKeyValue {
        match (a, b) {
            (ShardKeyValue::Int(x), ShardKeyValue::Int(y)) => {
                let mid = (*x as i128 + *y as i128).div_euclid(2);
                ShardKeyValue::Int(mid as i64)
            }
            _ => a.clone(),
        }
    }

    /// Returns true for the MinKey/MaxKey sentinels
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ShardKeyValue::MinKey | ShardKeyValue::MaxKey)
    }
}

impl From<i64> for ShardKeyValue {
    fn from(v: i64) -> Self {
        ShardKeyValue::Int(v)
    }
}

impl From<&str> for ShardKeyValue {
    fn from(v: &str) -> Self {
        ShardKeyValue::Str(v.to_string())
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKeyValue::MinKey => f.write_str("MinKey"),
            ShardKeyValue::Int(v) => write!(f, "{}", v),
            ShardKeyValue::Str(s) => write!(f, "\"{}\"", s),
            ShardKeyValue::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// Shard key specification: a single ascending range-partitioned field
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    /// Document field the collection is partitioned on
    pub field: String,
}

impl ShardKeyPattern {
    /// Creates a new key pattern on `field`
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ {}: 1 }}", self.field)
    }
}

/// Half-open key range `[min, max)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Inclusive lower bound
    pub min: ShardKeyValue,
    /// Exclusive upper bound
    pub max: ShardKeyValue,
}

impl ChunkRange {
    /// Creates a new range
    pub fn new(min: ShardKeyValue, max: ShardKeyValue) -> Self {
        Self { min, max }
    }

    /// The range covering the entire key space
    pub fn full() -> Self {
        Self {
            min: ShardKeyValue::MinKey,
            max: ShardKeyValue::MaxKey,
        }
    }

    /// Returns true if `key` falls inside `[min, max)`
    pub fn contains(&self, key: &ShardKeyValue) -> bool {
        *key >= self.min && *key < self.max
    }

    /// Returns true if `key` lies strictly between the bounds
    pub fn strictly_inside(&self, key: &ShardKeyValue) -> bool {
        *key > self.min && *key < self.max
    }

    /// Returns true if `other` lies entirely inside this range
    pub fn covers(&self, other: &ChunkRange) -> bool {
        other.min >= self.min && other.max <= self.max
    }

    /// Returns true if the two ranges share at least one key
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Identifies a chunk by collection and lower bound
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    /// Owning collection
    pub ns: Namespace,
    /// Lower bound of the chunk range
    pub min: ShardKeyValue,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ns, self.min)
    }
}

/// Wall-clock time in milliseconds since the Unix epoch
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(now.as_millis() as u64)
    }

    /// Creates a timestamp from raw milliseconds
    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    /// Returns the raw millisecond value
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns this timestamp shifted forward by `d`
    pub fn plus(self, d: std::time::Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as u64))
    }
}

/// Coarse classification of a [`MetaError`], surfaced to callers with every failure
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Cached chunk map is older than the stored one; refetch
    StaleVersion,
    /// Compare-and-swap lost against a concurrent commit; refetch and retry
    VersionConflict,
    /// Split point outside the chunk or on an existing boundary
    InvalidSplitPoint,
    /// Migration stopped before commit; ownership unchanged
    MigrationAborted,
    /// Another migration already holds the chunk or shard pair
    MigrationInProgress,
    /// Caller lacks the required action on the resource
    Unauthorized,
    /// Donor, recipient or config node unavailable
    Unreachable,
    /// Malformed or semantically invalid request
    InvalidRequest,
    /// Referenced namespace, database or shard does not exist
    NotFound,
    /// Storage or codec failure inside the coordinator
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error types for the chunk metadata coordinator
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The caller's view of the collection no longer matches the stored chunk map.
    #[error("stale chunk map for {ns}: expected {expected}, current {current}")]
    StaleVersion {
        /// Collection whose map is stale
        ns: Namespace,
        /// Version the caller held
        expected: CollectionVersion,
        /// Version currently stored
        current: CollectionVersion,
    },

    /// A compare-and-swap commit found the stored version had advanced.
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        /// Record the commit targeted
        key: String,
        /// Version the commit was conditioned on
        expected: String,
        /// Version found in the store
        found: String,
        /// Current collection version, when the record is a collection
        current: Option<CollectionVersion>,
    },

    /// A split point is outside the chunk or coincides with a boundary.
    #[error("invalid split point {point} for chunk {range}: {reason}")]
    InvalidSplitPoint {
        /// Offending split point
        point: ShardKeyValue,
        /// Range of the chunk being split
        range: ChunkRange,
        /// Why the point was rejected
        reason: String,
    },

    /// A migration was aborted before it committed.
    #[error("migration of chunk {chunk} aborted: {reason}")]
    MigrationAborted {
        /// Chunk being migrated
        chunk: ChunkId,
        /// Abort reason
        reason: String,
        /// Stored version, when the abort came from a version conflict
        current: Option<CollectionVersion>,
    },

    /// A migration for this chunk or donor/recipient pair is already running.
    #[error("migration already in progress for chunk {chunk}")]
    MigrationInProgress {
        /// Chunk that was requested
        chunk: ChunkId,
    },

    /// The caller is not allowed to perform the action.
    #[error("not authorized to {action} on {resource}")]
    Unauthorized {
        /// Action that was denied
        action: String,
        /// Resource the action targeted
        resource: String,
    },

    /// A shard or config node could not be contacted.
    #[error("{target} is unreachable")]
    Unreachable {
        /// The node that could not be contacted
        target: String,
    },

    /// The config replica set did not acknowledge a write with a majority in time.
    #[error("config write not acknowledged by majority: {acked} of {required} required")]
    MajorityUnavailable {
        /// Members that acknowledged
        acked: usize,
        /// Members required for a majority
        required: usize,
    },

    /// A write hit a range inside a migration critical section.
    #[error("writes to {range} of {ns} are blocked by a migration critical section")]
    WriteBlocked {
        /// Collection being written
        ns: Namespace,
        /// Blocked range
        range: ChunkRange,
    },

    /// The collection is not sharded.
    #[error("namespace {0} not found")]
    NamespaceNotFound(Namespace),

    /// The database has no record in the config store.
    #[error("database {0} not found")]
    DatabaseNotFound(String),

    /// The shard is not in the inventory.
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    /// shardCollection on a collection that is already sharded.
    #[error("collection {0} is already sharded")]
    AlreadySharded(Namespace),

    /// shardCollection before enableSharding on the database.
    #[error("sharding not enabled for database {0}")]
    ShardingNotEnabled(String),

    /// The balancer lease is held by another live instance.
    #[error("balancer lease held by {holder} until {expires_at_ms}")]
    LeaseHeld {
        /// Current lease holder
        holder: String,
        /// Lease expiry in wall-clock millis
        expires_at_ms: u64,
    },

    /// The request is well-formed but cannot be honored.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A namespace string could not be parsed.
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A chunk map failed its partition invariant.
    #[error("invalid chunk map: {0}")]
    InvalidChunkMap(String),

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl MetaError {
    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::StaleVersion { .. } => ErrorKind::StaleVersion,
            MetaError::VersionConflict { .. } => ErrorKind::VersionConflict,
            MetaError::InvalidSplitPoint { .. } => ErrorKind::InvalidSplitPoint,
            MetaError::MigrationAborted { .. } => ErrorKind::MigrationAborted,
            MetaError::MigrationInProgress { .. } | MetaError::WriteBlocked { .. } => {
                ErrorKind::MigrationInProgress
            }
            MetaError::Unauthorized { .. } => ErrorKind::Unauthorized,
            MetaError::Unreachable { .. } | MetaError::MajorityUnavailable { .. } => {
                ErrorKind::Unreachable
            }
            MetaError::AlreadySharded(_)
            | MetaError::ShardingNotEnabled(_)
            | MetaError::LeaseHeld { .. }
            | MetaError::InvalidRequest(_)
            | MetaError::InvalidNamespace(_)
            | MetaError::InvalidConfig(_) => ErrorKind::InvalidRequest,
            MetaError::NamespaceNotFound(_)
            | MetaError::DatabaseNotFound(_)
            | MetaError::ShardNotFound(_) => ErrorKind::NotFound,
            MetaError::InvalidChunkMap(_) | MetaError::KvError(_) | MetaError::Codec(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a caller may reasonably retry the request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StaleVersion
                | ErrorKind::VersionConflict
                | ErrorKind::MigrationAborted
                | ErrorKind::MigrationInProgress
                | ErrorKind::Unreachable
        )
    }

    /// Whether the coordinator retries this error itself before surfacing it
    pub fn is_internally_retried(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StaleVersion | ErrorKind::VersionConflict | ErrorKind::Unreachable
        )
    }

    /// The stored version that made this request stale or conflicting
    pub fn conflicting_version(&self) -> Option<CollectionVersion> {
        match self {
            MetaError::StaleVersion { current, .. } => Some(*current),
            MetaError::VersionConflict { current, .. }
            | MetaError::MigrationAborted { current, .. } => *current,
            _ => None,
        }
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Codec(e.to_string())
    }
}
