use crate::clock::Timestamp;
use crate::error::RevNum;
use crate::id::AuthorId;
use serde::{Deserialize, Serialize};

/// The transition from revision `rev_num - 1` to revision `rev_num` of one
/// part.
///
/// On the way *into* `update` the revision number is the base the client
/// edited against plus one; everywhere else it is the committed revision.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Change<D> {
    /// The revision this change produces.
    pub rev_num: RevNum,
    /// The part-specific delta.
    pub delta: D,
    /// Submission time; server-originated changes use the server clock.
    pub timestamp: Timestamp,
    /// The submitter, or `None` for server-originated changes.
    pub author_id: Option<AuthorId>,
}

impl<D> Change<D> {
    /// Creates a change.
    pub fn new(
        rev_num: RevNum,
        delta: D,
        timestamp: Timestamp,
        author_id: Option<AuthorId>,
    ) -> Self {
        Self {
            rev_num,
            delta,
            timestamp,
            author_id,
        }
    }
}

/// An immutable view of one part's contents at one revision.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<C> {
    /// The revision this snapshot reflects.
    pub rev_num: RevNum,
    /// Part-specific contents.
    pub contents: C,
}

impl<C> Snapshot<C> {
    /// Creates a snapshot.
    pub fn new(rev_num: RevNum, contents: C) -> Self {
        Self { rev_num, contents }
    }
}
