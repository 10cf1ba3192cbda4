use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A slash-separated storage path inside a document file.
///
/// Paths always start with `/` and every segment matches
/// `[-._A-Za-z0-9]+`. The reserved keys of the file layout are built with
/// the constructors below; nothing else in the engine fabricates paths by
/// hand.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoragePath(String);

fn segment_ok(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_')
}

impl StoragePath {
    /// Parses a path, rejecting malformed segments with *BadValue*.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let mut segments = path.split('/');
        if segments.next() != Some("") {
            return Err(Error::bad_value(format!("path must be absolute: {path}")));
        }
        let mut count = 0;
        for segment in segments {
            if !segment_ok(segment) {
                return Err(Error::bad_value(format!("bad path segment in {path}")));
            }
            count += 1;
        }
        if count == 0 {
            return Err(Error::bad_value("empty path"));
        }
        Ok(Self(path))
    }

    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is `prefix` or lies below it.
    pub fn is_under(&self, prefix: &StoragePath) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// The schema version key.
    pub fn schema_version() -> Self {
        Self("/schema_version".into())
    }

    /// `/<part>/revision_number`.
    pub fn revision_number(part: &str) -> Self {
        Self(format!("/{part}/revision_number"))
    }

    /// `/<part>/change/<n>`, with `n` in plain decimal.
    pub fn change(part: &str, rev_num: u64) -> Self {
        Self(format!("/{part}/change/{rev_num}"))
    }

    /// `/<part>/change`, the prefix all of a part's changes live under.
    pub fn change_prefix(part: &str) -> Self {
        Self(format!("/{part}/change"))
    }

    /// `/<part>/stored_snapshot`, used by ephemeral parts when truncating.
    pub fn stored_snapshot(part: &str) -> Self {
        Self(format!("/{part}/stored_snapshot"))
    }
}

impl std::fmt::Display for StoragePath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
