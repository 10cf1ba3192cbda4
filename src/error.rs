use crate::path::StoragePath;
use std::time::Duration;

/// Revision numbers are non-negative and contiguous within a part.
pub type RevNum = u64;

/// Errors reported by the engine, by kind rather than by site.
///
/// `Clone` is deliberate: materialized snapshots are shared between
/// concurrent callers as `Shared` futures, and a failed materialization
/// has to be reportable to every waiter.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The file, or a path that must exist, does not.
    #[error("not found")]
    NotFound,
    /// A revision outside the currently-available range was requested.
    #[error("revision not available: {0}")]
    RevisionNotAvailable(RevNum),
    /// A stored value failed structural validation.
    #[error("bad stored data: {0}")]
    BadData(String),
    /// An argument violated a declared constraint.
    #[error("bad value: {0}")]
    BadValue(String),
    /// An operation was invoked outside its allowed lifecycle.
    #[error("bad use: {0}")]
    BadUse(String),
    /// A retry budget was exhausted.
    #[error("aborted: {0}")]
    Aborted(String),
    /// A storage-level wait expired.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// A `check_path_absent` precondition found the path occupied.
    #[error("path not empty: {0}")]
    PathNotEmpty(StoragePath),
    /// A `check_path_is` precondition found a different value.
    #[error("path mismatch: {0}")]
    PathMismatch(StoragePath),
    /// A `check_path_present` precondition found nothing.
    #[error("path not present: {0}")]
    PathNotPresent(StoragePath),
    /// An internal invariant failed; this is a bug.
    #[error("internal invariant violated: {0}")]
    Wtf(String),
}

impl Error {
    pub(crate) fn bad_data(msg: impl Into<String>) -> Self {
        Self::BadData(msg.into())
    }

    pub(crate) fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    pub(crate) fn bad_use(msg: impl Into<String>) -> Self {
        Self::BadUse(msg.into())
    }

    /// True for the two storage conditions that mean "another writer got
    /// there first" and nothing worse.
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::PathNotEmpty(_) | Self::PathMismatch(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
