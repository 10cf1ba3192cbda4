use crate::change::{Change, Snapshot};
use crate::clock::Timestamp;
use crate::complex::FileAccess;
use crate::error::{Error, Result, RevNum};
use crate::path::StoragePath;
use crate::schema::ValidationStatus;
use crate::snapshot::SnapshotManager;
use crate::store::TransactionSpec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Total wall-time budget for one `update` call.
pub const MAX_APPEND_TIME: Duration = Duration::from_secs(20);
/// First backoff delay after a lost append race.
pub const INITIAL_APPEND_RETRY: Duration = Duration::from_millis(50);
/// Growth factor applied to the backoff delay after each lost race.
pub const APPEND_RETRY_FACTOR: u32 = 5;
/// Most change reads issued in a single storage transaction.
pub const MAX_CHANGE_READS_PER_TRANSACTION: u64 = 20;

/// How many paths past the head are probed for stray changes during
/// validation.
const VALIDATION_PROBE_SPAN: u64 = 10;

/// How a part reconciles a change built against a stale base with the
/// revisions that landed in between.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebaseMode {
    /// Positional transform of the client delta over the composed server
    /// delta; the body's algorithm.
    Transform,
    /// Replay the intervening revisions over the client's expected view
    /// and append the diff; sufficient for the keyed algebras.
    Converge,
}

/// The delta algebra and storage parameters a [`Control`] runs on.
pub trait Part: Send + Sync + 'static {
    /// The part's delta type.
    type Delta: Clone
        + Debug
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    /// The part's snapshot contents type.
    type Contents: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Storage-path prefix for this part.
    const NAME: &'static str;
    /// Whether history may be truncated behind a stored snapshot.
    const EPHEMERAL: bool;
    /// Which rebase flavor `update` uses.
    const REBASE: RebaseMode;

    /// The contents of revision 0.
    fn empty_contents() -> Self::Contents;
    /// Applies a delta to contents.
    fn apply(contents: &Self::Contents, delta: &Self::Delta) -> Result<Self::Contents>;
    /// Sequential composition of two deltas.
    fn compose(a: &Self::Delta, b: &Self::Delta) -> Self::Delta;
    /// Rebases `b` to apply after `a`; `a_first` wins position ties.
    fn transform(a: &Self::Delta, b: &Self::Delta, a_first: bool) -> Self::Delta;
    /// The delta rewriting `old` into `new`.
    fn diff(old: &Self::Contents, new: &Self::Contents) -> Self::Delta;
    /// True for a delta that cannot change anything.
    fn is_empty(delta: &Self::Delta) -> bool;
    /// Structural validation of a submitted delta.
    fn validate(delta: &Self::Delta) -> Result<()>;
}

pub(crate) fn rev_num_path<P: Part>() -> StoragePath {
    StoragePath::revision_number(P::NAME)
}

pub(crate) fn change_path<P: Part>(rev_num: RevNum) -> StoragePath {
    StoragePath::change(P::NAME, rev_num)
}

/// Reads and decodes changes `[start, end)` in bounded batches.
pub(crate) async fn read_changes<P: Part>(
    access: &FileAccess,
    start: RevNum,
    end: RevNum,
) -> Result<Vec<Change<P::Delta>>> {
    if start > end {
        return Err(Error::Wtf(format!("bad change range [{start}, {end})")));
    }
    let mut out = Vec::with_capacity((end - start) as usize);
    let mut next = start;
    while next < end {
        let batch_end = end.min(next + MAX_CHANGE_READS_PER_TRANSACTION);
        let mut spec = TransactionSpec::new();
        for n in next..batch_end {
            spec = spec.read_path(change_path::<P>(n));
        }
        let result = access.file.transact(spec).await?;
        for n in next..batch_end {
            let path = change_path::<P>(n);
            match result.value(&path) {
                Some(bytes) => {
                    let change: Change<P::Delta> = access.codec.decode(bytes)?;
                    if change.rev_num != n {
                        return Err(Error::bad_data(format!(
                            "change at {path} numbered {}",
                            change.rev_num
                        )));
                    }
                    out.push(change);
                }
                None if P::EPHEMERAL => return Err(Error::RevisionNotAvailable(n)),
                None => return Err(Error::bad_data(format!("{path} missing"))),
            }
        }
        next = batch_end;
    }
    Ok(out)
}

/// Applies the changes `[start, end)` to `base`, left to right.
pub(crate) async fn composed_contents<P: Part>(
    access: &FileAccess,
    base: P::Contents,
    start: RevNum,
    end: RevNum,
) -> Result<P::Contents> {
    let mut acc = base;
    for change in read_changes::<P>(access, start, end).await? {
        acc = P::apply(&acc, &change.delta)?;
    }
    Ok(acc)
}

/// Reads an ephemeral part's stored snapshot, if any.
pub(crate) async fn read_stored_snapshot<P: Part>(
    access: &FileAccess,
) -> Result<Option<Snapshot<P::Contents>>> {
    if !P::EPHEMERAL {
        return Ok(None);
    }
    let path = StoragePath::stored_snapshot(P::NAME);
    let result = access
        .file
        .transact(TransactionSpec::new().read_path(path.clone()))
        .await?;
    match result.value(&path) {
        Some(bytes) => Ok(Some(access.codec.decode(bytes)?)),
        None => Ok(None),
    }
}

/// Outcome of one append attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Append {
    /// The transaction committed; the change is the new head.
    Done,
    /// Another writer took the revision slot first.
    LostRace,
}

/// The revision-log engine shared by the three parts.
///
/// A control is a cheap clonable handle; clones share the snapshot cache
/// and the underlying file.
pub struct Control<P: Part> {
    access: FileAccess,
    snapshots: SnapshotManager<P>,
}

impl<P: Part> Clone for Control<P> {
    fn clone(&self) -> Self {
        Self {
            access: self.access.clone(),
            snapshots: self.snapshots.clone(),
        }
    }
}

impl<P: Part> Control<P> {
    pub(crate) fn new(access: FileAccess) -> Self {
        let snapshots = SnapshotManager::new(access.clone());
        Self { access, snapshots }
    }

    pub(crate) fn access(&self) -> &FileAccess {
        &self.access
    }

    /// The instantaneously-current revision number.
    pub async fn current_rev_num(&self) -> Result<RevNum> {
        let path = rev_num_path::<P>();
        let result = self
            .access
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await?;
        let bytes = result
            .value(&path)
            .ok_or_else(|| Error::bad_data(format!("{path} missing")))?;
        self.access.codec.decode_rev_num(bytes)
    }

    /// The single change that produced revision `rev_num`.
    pub async fn get_change(&self, rev_num: RevNum) -> Result<Change<P::Delta>> {
        let current = self.current_rev_num().await?;
        if rev_num > current {
            return Err(Error::RevisionNotAvailable(rev_num));
        }
        let path = change_path::<P>(rev_num);
        let result = self
            .access
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await?;
        match result.value(&path) {
            Some(bytes) => self.access.codec.decode(bytes),
            None if P::EPHEMERAL => Err(Error::RevisionNotAvailable(rev_num)),
            None => Err(Error::bad_data(format!("{path} missing"))),
        }
    }

    /// The composition of every change strictly after `base_rev_num`.
    ///
    /// When `base_rev_num` is the current revision the call suspends
    /// until a later revision exists; storage wait timeouts turn into
    /// another look, never into a caller-visible error.
    pub async fn get_change_after(&self, base_rev_num: RevNum) -> Result<Change<P::Delta>> {
        loop {
            let current = self.current_rev_num().await?;
            if base_rev_num > current {
                return Err(Error::RevisionNotAvailable(base_rev_num));
            }
            if base_rev_num < current {
                let (delta, timestamp) =
                    self.composed_deltas(base_rev_num + 1, current + 1).await?;
                return Ok(Change::new(current, delta, timestamp, None));
            }
            let encoded = self.access.codec.encode(&current)?;
            let spec =
                TransactionSpec::new().when_path_not(rev_num_path::<P>(), Some(encoded));
            match self.access.file.transact(spec).await {
                Ok(_) | Err(Error::TimedOut(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// A snapshot at `rev_num`, or at the current revision when `None`.
    pub async fn get_snapshot(&self, rev_num: Option<RevNum>) -> Result<Snapshot<P::Contents>> {
        let rev_num = match rev_num {
            Some(rev_num) => {
                let current = self.current_rev_num().await?;
                if rev_num > current {
                    return Err(Error::RevisionNotAvailable(rev_num));
                }
                rev_num
            }
            None => self.current_rev_num().await?,
        };
        self.snapshots.get(rev_num).await
    }

    /// Linearizes a client change into the revision history.
    ///
    /// `change.rev_num` is the base revision the client edited against,
    /// plus one. The returned correction, applied to the client's
    /// optimistic local result, yields the server-authoritative state at
    /// the correction's revision.
    pub async fn update(&self, change: Change<P::Delta>) -> Result<Change<P::Delta>> {
        if change.rev_num < 1 {
            return Err(Error::bad_value("change revision number must be at least 1"));
        }
        P::validate(&change.delta)?;
        let base_rev = change.rev_num - 1;
        match self.get_change(base_rev).await {
            Ok(base) if change.timestamp < base.timestamp => {
                return Err(Error::bad_value("change timestamp precedes its base"));
            }
            Ok(_) => {}
            Err(Error::RevisionNotAvailable(_)) if P::EPHEMERAL => {}
            Err(err) => return Err(err),
        }
        if P::is_empty(&change.delta) {
            // contributed nothing; the client is already converged
            return Ok(Change::new(
                base_rev,
                P::Delta::default(),
                change.timestamp,
                change.author_id,
            ));
        }
        let base_snapshot = self.get_snapshot(Some(base_rev)).await?;
        let expected = P::apply(&base_snapshot.contents, &change.delta)?;

        let started = Instant::now();
        let mut backoff = INITIAL_APPEND_RETRY;
        loop {
            let current = self.get_snapshot(None).await?;
            let settled = if current.rev_num == base_rev {
                self.append_fresh(&change, &current).await?
            } else {
                match P::REBASE {
                    RebaseMode::Transform => {
                        self.rebase_transform(&change, &expected, &current).await?
                    }
                    RebaseMode::Converge => {
                        self.rebase_converge(&change, &expected, &current).await?
                    }
                }
            };
            if let Some(correction) = settled {
                return Ok(correction);
            }
            if started.elapsed() >= MAX_APPEND_TIME {
                return Err(Error::Aborted("too many failed attempts".into()));
            }
            tracing::info!(part = P::NAME, ?backoff, "lost append race, retrying");
            async_std::task::sleep(backoff).await;
            backoff *= APPEND_RETRY_FACTOR;
        }
    }

    /// Fast path: the client's base is still the head.
    async fn append_fresh(
        &self,
        change: &Change<P::Delta>,
        current: &Snapshot<P::Contents>,
    ) -> Result<Option<Change<P::Delta>>> {
        let attempt = Change::new(
            current.rev_num + 1,
            change.delta.clone(),
            change.timestamp,
            change.author_id.clone(),
        );
        match self.append_change(&attempt).await? {
            Append::LostRace => Ok(None),
            Append::Done => Ok(Some(Change::new(
                attempt.rev_num,
                P::Delta::default(),
                change.timestamp,
                change.author_id.clone(),
            ))),
        }
    }

    /// Rebase path for the positional algebra: transform the client delta
    /// over the composed server delta, with the server winning position
    /// ties.
    async fn rebase_transform(
        &self,
        change: &Change<P::Delta>,
        expected: &P::Contents,
        current: &Snapshot<P::Contents>,
    ) -> Result<Option<Change<P::Delta>>> {
        let base_rev = change.rev_num - 1;
        let (server_delta, _) = self.composed_deltas(base_rev + 1, current.rev_num + 1).await?;
        let next = P::transform(&server_delta, &change.delta, true);
        if P::is_empty(&next) {
            return Ok(Some(Change::new(
                current.rev_num,
                P::Delta::default(),
                change.timestamp,
                change.author_id.clone(),
            )));
        }
        let attempt = Change::new(
            current.rev_num + 1,
            next,
            change.timestamp,
            change.author_id.clone(),
        );
        match self.append_change(&attempt).await? {
            Append::LostRace => Ok(None),
            Append::Done => {
                let final_snapshot = self.get_snapshot(Some(attempt.rev_num)).await?;
                let correction = P::diff(expected, &final_snapshot.contents);
                Ok(Some(Change::new(
                    attempt.rev_num,
                    correction,
                    change.timestamp,
                    change.author_id.clone(),
                )))
            }
        }
    }

    /// Rebase path for the keyed algebras: replay the intervening
    /// revisions over the client's expected view and append the diff
    /// from the head; last writer per key wins.
    async fn rebase_converge(
        &self,
        change: &Change<P::Delta>,
        expected: &P::Contents,
        current: &Snapshot<P::Contents>,
    ) -> Result<Option<Change<P::Delta>>> {
        let base_rev = change.rev_num - 1;
        let final_contents = composed_contents::<P>(
            &self.access,
            expected.clone(),
            base_rev + 1,
            current.rev_num + 1,
        )
        .await?;
        let delta = P::diff(&current.contents, &final_contents);
        if P::is_empty(&delta) {
            return Ok(Some(Change::new(
                current.rev_num,
                P::Delta::default(),
                change.timestamp,
                change.author_id.clone(),
            )));
        }
        let attempt = Change::new(
            current.rev_num + 1,
            delta,
            change.timestamp,
            change.author_id.clone(),
        );
        match self.append_change(&attempt).await? {
            Append::LostRace => Ok(None),
            Append::Done => {
                let correction = P::diff(expected, &final_contents);
                Ok(Some(Change::new(
                    attempt.rev_num,
                    correction,
                    change.timestamp,
                    change.author_id.clone(),
                )))
            }
        }
    }

    /// Commits `change` at its revision slot, or reports a lost race.
    ///
    /// The two preconditions are the complete correctness guard: at any
    /// moment at most one writer can satisfy both for a given slot.
    pub(crate) async fn append_change(&self, change: &Change<P::Delta>) -> Result<Append> {
        let rev = change.rev_num;
        let spec = TransactionSpec::new()
            .check_path_absent(change_path::<P>(rev))
            .check_path_is(rev_num_path::<P>(), self.access.codec.encode(&(rev - 1))?)
            .write_path(change_path::<P>(rev), self.access.codec.encode(change)?)
            .write_path(rev_num_path::<P>(), self.access.codec.encode(&rev)?);
        match self.access.file.transact(spec).await {
            Ok(_) => Ok(Append::Done),
            Err(err) if err.is_lost_race() => Ok(Append::LostRace),
            Err(err) => Err(err),
        }
    }

    /// Folds the deltas of changes `[start, end)`, returning the
    /// composition and the newest constituent timestamp.
    pub(crate) async fn composed_deltas(
        &self,
        start: RevNum,
        end: RevNum,
    ) -> Result<(P::Delta, Timestamp)> {
        let mut acc = P::Delta::default();
        let mut timestamp = Timestamp::default();
        for change in read_changes::<P>(&self.access, start, end).await? {
            acc = P::compose(&acc, &change.delta);
            timestamp = change.timestamp;
        }
        Ok((acc, timestamp))
    }

    /// Walks this part's stored log and reports a status verdict.
    pub(crate) async fn validate(&self) -> ValidationStatus {
        match self.validate_inner().await {
            Ok(status) => status,
            Err(err) => {
                tracing::info!(part = P::NAME, %err, "log validation failed");
                ValidationStatus::Error
            }
        }
    }

    async fn validate_inner(&self) -> Result<ValidationStatus> {
        if !self.access.file.exists().await? {
            return Ok(ValidationStatus::NotFound);
        }
        let rev_path = rev_num_path::<P>();
        let result = self
            .access
            .file
            .transact(TransactionSpec::new().read_path(rev_path.clone()))
            .await?;
        let current = match result
            .value(&rev_path)
            .map(|bytes| self.access.codec.decode_rev_num(bytes))
        {
            Some(Ok(current)) => current,
            _ => return Ok(ValidationStatus::Error),
        };
        let mut walk_start = 0;
        if P::EPHEMERAL {
            match read_stored_snapshot::<P>(&self.access).await {
                Ok(None) => {}
                Ok(Some(snapshot)) if snapshot.rev_num <= current => {
                    walk_start = snapshot.rev_num + 1;
                }
                _ => return Ok(ValidationStatus::Error),
            }
        }
        if read_changes::<P>(&self.access, walk_start, current + 1)
            .await
            .is_err()
        {
            return Ok(ValidationStatus::Error);
        }
        let mut probe = TransactionSpec::new();
        for n in current + 1..=current + VALIDATION_PROBE_SPAN {
            probe = probe.read_path(change_path::<P>(n));
        }
        let result = self.access.file.transact(probe).await?;
        for n in current + 1..=current + VALIDATION_PROBE_SPAN {
            if result.value(&change_path::<P>(n)).is_some() {
                return Ok(ValidationStatus::Error);
            }
        }
        Ok(ValidationStatus::Ok)
    }

    /// Appends this part's creation writes to a bootstrap transaction:
    /// change 0 is the empty change and the head is revision 0.
    pub(crate) fn init_spec(&self, spec: TransactionSpec) -> Result<TransactionSpec> {
        let zero: Change<P::Delta> =
            Change::new(0, P::Delta::default(), Timestamp::default(), None);
        Ok(spec
            .write_path(change_path::<P>(0), self.access.codec.encode(&zero)?)
            .write_path(rev_num_path::<P>(), self.access.codec.encode(&0u64)?))
    }

    /// Drops the snapshot cache; used when the file is re-initialized.
    pub(crate) fn clear_snapshots(&self) {
        self.snapshots.clear();
    }
}
