use crate::error::Result;
use crate::id::DocId;
use crate::path::StoragePath;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// How long a suspending transaction waits before failing *TimedOut*.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One operation inside a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreOp {
    /// Remove every key in the file.
    DeleteAll,
    /// Unconditionally write `path := value`.
    WritePath(StoragePath, Vec<u8>),
    /// Remove one key; absent keys are fine.
    DeletePath(StoragePath),
    /// Read a value; absent keys yield no entry in the result.
    ReadPath(StoragePath),
    /// List the stored paths under a prefix.
    ListPath(StoragePath),
    /// Precondition: the path must exist, else *PathNotPresent*.
    CheckPathPresent(StoragePath),
    /// Precondition: the path must not exist, else *PathNotEmpty*.
    CheckPathAbsent(StoragePath),
    /// Precondition: the path must hold exactly `value`, else *PathMismatch*.
    CheckPathIs(StoragePath, Vec<u8>),
    /// Suspend the transaction until the path holds something other than
    /// `value` (`None` meaning "until the path exists"). Subject to the
    /// spec's wait timeout.
    WhenPathNot(StoragePath, Option<Vec<u8>>),
}

/// An atomic sequence of operations against one file.
///
/// All preconditions (including `WhenPathNot` conditions) are evaluated
/// against a single consistent view; mutations apply only if every
/// precondition holds, and apply all at once.
#[derive(Clone, Debug, Default)]
pub struct TransactionSpec {
    ops: Vec<StoreOp>,
    timeout: Option<Duration>,
}

impl TransactionSpec {
    /// Creates an empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn op(mut self, op: StoreOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Appends `DeleteAll`.
    pub fn delete_all(self) -> Self {
        self.op(StoreOp::DeleteAll)
    }

    /// Appends a write.
    pub fn write_path(self, path: StoragePath, value: Vec<u8>) -> Self {
        self.op(StoreOp::WritePath(path, value))
    }

    /// Appends a single-key delete.
    pub fn delete_path(self, path: StoragePath) -> Self {
        self.op(StoreOp::DeletePath(path))
    }

    /// Appends a read.
    pub fn read_path(self, path: StoragePath) -> Self {
        self.op(StoreOp::ReadPath(path))
    }

    /// Appends a prefix listing.
    pub fn list_path(self, prefix: StoragePath) -> Self {
        self.op(StoreOp::ListPath(prefix))
    }

    /// Appends a must-exist precondition.
    pub fn check_path_present(self, path: StoragePath) -> Self {
        self.op(StoreOp::CheckPathPresent(path))
    }

    /// Appends a must-not-exist precondition.
    pub fn check_path_absent(self, path: StoragePath) -> Self {
        self.op(StoreOp::CheckPathAbsent(path))
    }

    /// Appends an exact-value precondition.
    pub fn check_path_is(self, path: StoragePath, value: Vec<u8>) -> Self {
        self.op(StoreOp::CheckPathIs(path, value))
    }

    /// Appends a suspending not-equal condition.
    pub fn when_path_not(self, path: StoragePath, value: Option<Vec<u8>>) -> Self {
        self.op(StoreOp::WhenPathNot(path, value))
    }

    /// Overrides the wait timeout for suspending conditions.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The operations, in order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// The effective wait timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT)
    }

    /// True if any operation can suspend.
    pub fn suspends(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, StoreOp::WhenPathNot(..)))
    }
}

/// Per-operation reads produced by a committed transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionResult {
    values: BTreeMap<StoragePath, Vec<u8>>,
    listings: BTreeSet<StoragePath>,
}

impl TransactionResult {
    pub(crate) fn insert_value(&mut self, path: StoragePath, value: Vec<u8>) {
        self.values.insert(path, value);
    }

    pub(crate) fn insert_listing(&mut self, path: StoragePath) {
        self.listings.insert(path);
    }

    /// The value read at `path`, if the path was present.
    pub fn value(&self, path: &StoragePath) -> Option<&[u8]> {
        self.values.get(path).map(|v| v.as_slice())
    }

    /// All paths produced by `ListPath` operations.
    pub fn listings(&self) -> impl Iterator<Item = &StoragePath> {
        self.listings.iter()
    }
}

/// A transactional key-value file holding one document.
#[async_trait]
pub trait File: Send + Sync + 'static {
    /// True if the file exists in the store.
    async fn exists(&self) -> Result<bool>;

    /// Creates the file. Idempotent: a second creator (or an already
    /// present file) is not an error, but the caller must tolerate a
    /// created-empty result.
    async fn create(&self) -> Result<()>;

    /// Runs one atomic transaction.
    async fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult>;
}

/// Resolves document ids to files.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Returns a handle to the file for `id`. The handle may refer to a
    /// file that does not exist yet.
    async fn open(&self, id: &DocId) -> Result<Arc<dyn File>>;
}
