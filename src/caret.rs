use crate::change::{Change, Snapshot};
use crate::clock::Timestamp;
use crate::complex::FileAccess;
use crate::control::{Control, Part, RebaseMode};
use crate::error::{Error, Result, RevNum};
use crate::id::SessionId;
use crate::path::StoragePath;
use crate::store::TransactionSpec;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// How long a session may sit idle before the sweeper drops its caret.
pub const MAX_SESSION_IDLE: Duration = Duration::from_secs(5 * 60);

/// Caret revisions between stored-snapshot truncations of the log.
const CARET_SNAPSHOT_INTERVAL: u64 = 100;

/// Hue-spaced palette carets are colored from.
const PALETTE: [&str; 12] = [
    "#db4437", "#e91e63", "#9c27b0", "#673ab7", "#3f51b5", "#4285f4", "#03a9f4", "#009688",
    "#0f9d58", "#8bc34a", "#f4b400", "#ff6d00",
];

/// A `#rrggbb` caret color, assigned once per session and never changed.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(String);

impl Color {
    /// Parses a lowercase `#rrggbb` string.
    pub fn new(color: impl Into<String>) -> Result<Self> {
        let color = color.into();
        let hex = color.strip_prefix('#').unwrap_or("");
        if hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            Ok(Self(color))
        } else {
            Err(Error::bad_value(format!("bad caret color {color:?}")))
        }
    }

    /// Returns the color string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Picks a color for a new session, avoiding those already on screen.
fn pick_color(used: &BTreeSet<&Color>) -> Color {
    for candidate in PALETTE {
        let candidate = Color(candidate.into());
        if !used.contains(&candidate) {
            return candidate;
        }
    }
    // every palette entry is in use somewhere; reuse one at random
    let index = rand::thread_rng().gen_range(0..PALETTE.len());
    Color(PALETTE[index].into())
}

/// One session's caret and selection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Caret {
    /// The owning session.
    pub session_id: SessionId,
    /// When the session last updated its caret.
    pub last_active: Timestamp,
    /// The *body* revision the position refers to.
    pub doc_rev_num: RevNum,
    /// Selection start.
    pub index: u64,
    /// Selection length; zero for a bare caret.
    pub length: u64,
    /// Display color.
    pub color: Color,
}

/// The numeric caret fields an update may change. `color` is absent on
/// purpose: it is fixed at session creation.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaretField {
    /// `doc_rev_num`.
    DocRevNum,
    /// `last_active`, in milliseconds.
    LastActive,
    /// `index`.
    Index,
    /// `length`.
    Length,
}

impl Caret {
    pub(crate) fn get(&self, field: CaretField) -> u64 {
        match field {
            CaretField::DocRevNum => self.doc_rev_num,
            CaretField::LastActive => self.last_active.0,
            CaretField::Index => self.index,
            CaretField::Length => self.length,
        }
    }

    pub(crate) fn set(&mut self, field: CaretField, value: u64) {
        match field {
            CaretField::DocRevNum => self.doc_rev_num = value,
            CaretField::LastActive => self.last_active = Timestamp(value),
            CaretField::Index => self.index = value,
            CaretField::Length => self.length = value,
        }
    }
}

const ALL_FIELDS: [CaretField; 4] = [
    CaretField::DocRevNum,
    CaretField::LastActive,
    CaretField::Index,
    CaretField::Length,
];

/// One caret operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaretOp {
    /// A session appeared.
    Begin(Caret),
    /// One field of an existing session's caret changed.
    SetField(SessionId, CaretField, u64),
    /// A session went away.
    End(SessionId),
}

/// The caret part's contents: one caret per live session.
pub type CaretMap = BTreeMap<SessionId, Caret>;

/// An ordered sequence of caret operations.
///
/// Sessions are independent; composition is field-wise last-writer-wins
/// within each session and canonicalizes to session order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaretDelta {
    ops: Vec<CaretOp>,
}

enum Effect {
    Reset(Option<Caret>),
    Patch(BTreeMap<CaretField, u64>),
}

impl CaretDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ops, in order.
    pub fn ops(&self) -> &[CaretOp] {
        &self.ops
    }

    /// Appends a session begin.
    pub fn begin(mut self, caret: Caret) -> Self {
        self.ops.push(CaretOp::Begin(caret));
        self
    }

    /// Appends a field update.
    pub fn set_field(mut self, session_id: SessionId, field: CaretField, value: u64) -> Self {
        self.ops.push(CaretOp::SetField(session_id, field, value));
        self
    }

    /// Appends a session end.
    pub fn end(mut self, session_id: SessionId) -> Self {
        self.ops.push(CaretOp::End(session_id));
        self
    }

    /// True for a delta with no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn fold<'a>(
        effects: &mut BTreeMap<SessionId, Effect>,
        ops: impl IntoIterator<Item = &'a CaretOp>,
    ) {
        for op in ops {
            match op {
                CaretOp::Begin(caret) => {
                    effects.insert(caret.session_id.clone(), Effect::Reset(Some(caret.clone())));
                }
                CaretOp::End(session_id) => {
                    effects.insert(session_id.clone(), Effect::Reset(None));
                }
                CaretOp::SetField(session_id, field, value) => {
                    match effects
                        .entry(session_id.clone())
                        .or_insert_with(|| Effect::Patch(BTreeMap::new()))
                    {
                        Effect::Reset(Some(caret)) => caret.set(*field, *value),
                        // fields of a session this delta already ended go nowhere
                        Effect::Reset(None) => {}
                        Effect::Patch(patch) => {
                            patch.insert(*field, *value);
                        }
                    }
                }
            }
        }
    }

    /// Sequential composition of `self` then `other`.
    pub fn compose(&self, other: &CaretDelta) -> CaretDelta {
        let mut effects = BTreeMap::new();
        Self::fold(&mut effects, &self.ops);
        Self::fold(&mut effects, &other.ops);
        let mut out = CaretDelta::new();
        for (session_id, effect) in effects {
            match effect {
                Effect::Reset(Some(caret)) => out.ops.push(CaretOp::Begin(caret)),
                Effect::Reset(None) => out.ops.push(CaretOp::End(session_id)),
                Effect::Patch(patch) => {
                    for (field, value) in patch {
                        out.ops
                            .push(CaretOp::SetField(session_id.clone(), field, value));
                    }
                }
            }
        }
        out
    }

    /// Applies the delta to a session map. Field updates and ends for
    /// absent sessions are dropped rather than invented.
    pub fn apply(&self, map: &CaretMap) -> CaretMap {
        let mut out = map.clone();
        for op in &self.ops {
            match op {
                CaretOp::Begin(caret) => {
                    out.insert(caret.session_id.clone(), caret.clone());
                }
                CaretOp::SetField(session_id, field, value) => {
                    if let Some(caret) = out.get_mut(session_id) {
                        caret.set(*field, *value);
                    }
                }
                CaretOp::End(session_id) => {
                    out.remove(session_id);
                }
            }
        }
        out
    }

    /// The delta rewriting `old` into `new`, field-wise per session.
    pub fn diff(old: &CaretMap, new: &CaretMap) -> CaretDelta {
        let mut out = CaretDelta::new();
        for (session_id, caret) in new {
            match old.get(session_id) {
                None => out.ops.push(CaretOp::Begin(caret.clone())),
                // a changed color means a replaced session, not an update
                Some(prior) if prior.color != caret.color => {
                    out.ops.push(CaretOp::End(session_id.clone()));
                    out.ops.push(CaretOp::Begin(caret.clone()));
                }
                Some(prior) => {
                    for field in ALL_FIELDS {
                        if prior.get(field) != caret.get(field) {
                            out.ops.push(CaretOp::SetField(
                                session_id.clone(),
                                field,
                                caret.get(field),
                            ));
                        }
                    }
                }
            }
        }
        for session_id in old.keys() {
            if !new.contains_key(session_id) {
                out.ops.push(CaretOp::End(session_id.clone()));
            }
        }
        out
    }
}

/// The ephemeral presence part.
#[derive(Debug)]
pub struct CaretPart;

impl Part for CaretPart {
    type Delta = CaretDelta;
    type Contents = CaretMap;

    const NAME: &'static str = "caret";
    const EPHEMERAL: bool = true;
    const REBASE: RebaseMode = RebaseMode::Converge;

    fn empty_contents() -> CaretMap {
        CaretMap::new()
    }

    fn apply(contents: &CaretMap, delta: &CaretDelta) -> Result<CaretMap> {
        Ok(delta.apply(contents))
    }

    fn compose(a: &CaretDelta, b: &CaretDelta) -> CaretDelta {
        a.compose(b)
    }

    // second argument wins on overlapping fields, identity elsewhere
    fn transform(_a: &CaretDelta, b: &CaretDelta, _a_first: bool) -> CaretDelta {
        b.clone()
    }

    fn diff(old: &CaretMap, new: &CaretMap) -> CaretDelta {
        CaretDelta::diff(old, new)
    }

    fn is_empty(delta: &CaretDelta) -> bool {
        delta.is_empty()
    }

    fn validate(delta: &CaretDelta) -> Result<()> {
        for op in delta.ops() {
            match op {
                CaretOp::Begin(caret) => {
                    if caret.session_id.as_str().is_empty() {
                        return Err(Error::bad_value("empty session id"));
                    }
                    Color::new(caret.color.as_str())?;
                }
                CaretOp::SetField(session_id, _, _) | CaretOp::End(session_id) => {
                    if session_id.as_str().is_empty() {
                        return Err(Error::bad_value("empty session id"));
                    }
                }
            }
        }
        Ok(())
    }
}

struct SweepState {
    next_idle_check: Mutex<Timestamp>,
}

/// The control over a document's session presence.
///
/// Beyond the shared revision-log engine this control manufactures its
/// own changes: field-wise diffs from client position reports, idle-session
/// removals, and reap notifications from the session layer. The caret log
/// is periodically truncated behind a stored snapshot.
#[derive(Clone)]
pub struct CaretControl {
    control: Control<CaretPart>,
    state: Arc<SweepState>,
}

impl CaretControl {
    pub(crate) fn new(access: FileAccess) -> Self {
        let first_check = access.now().add_millis(idle_check_interval());
        Self {
            control: Control::new(access),
            state: Arc::new(SweepState {
                next_idle_check: Mutex::new(first_check),
            }),
        }
    }

    pub(crate) fn control(&self) -> &Control<CaretPart> {
        &self.control
    }

    /// The instantaneously-current caret revision.
    pub async fn current_rev_num(&self) -> Result<RevNum> {
        self.control.current_rev_num().await
    }

    /// The single change that produced `rev_num`, if still retained.
    pub async fn get_change(&self, rev_num: RevNum) -> Result<Change<CaretDelta>> {
        self.control.get_change(rev_num).await
    }

    /// The composition of every change strictly after `base_rev_num`,
    /// suspending at the head.
    pub async fn get_change_after(&self, base_rev_num: RevNum) -> Result<Change<CaretDelta>> {
        self.control.get_change_after(base_rev_num).await
    }

    /// A snapshot at `rev_num`, or the current one. Reading the current
    /// snapshot is also the idle-sweep trigger.
    pub async fn get_snapshot(&self, rev_num: Option<RevNum>) -> Result<Snapshot<CaretMap>> {
        self.maybe_schedule_sweep();
        self.control.get_snapshot(rev_num).await
    }

    /// Linearizes a caret change built elsewhere; most callers want
    /// [`update_caret`](Self::update_caret) instead.
    pub async fn update(&self, change: Change<CaretDelta>) -> Result<Change<CaretDelta>> {
        let correction = self.control.update(change).await?;
        self.maybe_truncate(correction.rev_num).await;
        Ok(correction)
    }

    /// Applies one session's position report: a field-wise diff for a
    /// known session, or a session begin with a freshly assigned color.
    pub async fn update_caret(
        &self,
        session_id: &SessionId,
        doc_rev_num: RevNum,
        index: u64,
        length: u64,
    ) -> Result<Change<CaretDelta>> {
        let snapshot = self.get_snapshot(None).await?;
        let now = self.control.access().now();
        let delta = match snapshot.contents.get(session_id) {
            None => {
                let used: BTreeSet<&Color> =
                    snapshot.contents.values().map(|caret| &caret.color).collect();
                CaretDelta::new().begin(Caret {
                    session_id: session_id.clone(),
                    last_active: now,
                    doc_rev_num,
                    index,
                    length,
                    color: pick_color(&used),
                })
            }
            Some(prior) => {
                let mut next = prior.clone();
                next.last_active = now;
                next.doc_rev_num = doc_rev_num;
                next.index = index;
                next.length = length;
                let mut delta = CaretDelta::new();
                for field in ALL_FIELDS {
                    if prior.get(field) != next.get(field) {
                        delta = delta.set_field(session_id.clone(), field, next.get(field));
                    }
                }
                delta
            }
        };
        self.update(Change::new(snapshot.rev_num + 1, delta, now, None))
            .await
    }

    /// Drops a session whose owner the session layer has reclaimed.
    /// Best-effort: on failure the idle sweeper finishes the job.
    pub async fn reap_session(&self, session_id: &SessionId) {
        if let Err(err) = self.reap_inner(session_id).await {
            tracing::warn!(%session_id, %err, "session reap failed");
        }
    }

    async fn reap_inner(&self, session_id: &SessionId) -> Result<()> {
        let snapshot = self.control.get_snapshot(None).await?;
        if !snapshot.contents.contains_key(session_id) {
            return Ok(());
        }
        let delta = CaretDelta::new().end(session_id.clone());
        let now = self.control.access().now();
        self.update(Change::new(snapshot.rev_num + 1, delta, now, None))
            .await?;
        Ok(())
    }

    fn maybe_schedule_sweep(&self) {
        let now = self.control.access().now();
        {
            let mut next = self.state.next_idle_check.lock();
            if now < *next {
                return;
            }
            *next = now.add_millis(idle_check_interval());
        }
        let this = self.clone();
        async_std::task::spawn(async move {
            if let Err(err) = this.sweep().await {
                // another server may have swept concurrently; not our problem
                tracing::warn!(%err, "idle-session sweep failed");
            }
        });
    }

    /// Removes every session idle longer than [`MAX_SESSION_IDLE`].
    pub async fn sweep(&self) -> Result<()> {
        let snapshot = self.control.get_snapshot(None).await?;
        let now = self.control.access().now();
        let min_time = now.sub_millis(MAX_SESSION_IDLE.as_millis() as u64);
        let mut delta = CaretDelta::new();
        for (session_id, caret) in &snapshot.contents {
            if caret.last_active < min_time {
                delta = delta.end(session_id.clone());
            }
        }
        if delta.is_empty() {
            return Ok(());
        }
        self.update(Change::new(snapshot.rev_num + 1, delta, now, None))
            .await?;
        Ok(())
    }

    /// Every `CARET_SNAPSHOT_INTERVAL` revisions, stores a snapshot and
    /// deletes the changes it covers. Best-effort housekeeping.
    async fn maybe_truncate(&self, rev_num: RevNum) {
        if rev_num == 0 || rev_num % CARET_SNAPSHOT_INTERVAL != 0 {
            return;
        }
        if let Err(err) = self.truncate(rev_num).await {
            tracing::warn!(rev_num, %err, "caret log truncation failed");
        }
    }

    async fn truncate(&self, rev_num: RevNum) -> Result<()> {
        let snapshot = self.control.get_snapshot(Some(rev_num)).await?;
        let access = self.control.access();
        let prefix = StoragePath::change_prefix(CaretPart::NAME);
        let listing = access
            .file
            .transact(TransactionSpec::new().list_path(prefix))
            .await?;
        let mut spec = TransactionSpec::new().write_path(
            StoragePath::stored_snapshot(CaretPart::NAME),
            access.codec.encode(&snapshot)?,
        );
        for path in listing.listings() {
            let covered = path
                .as_str()
                .rsplit('/')
                .next()
                .and_then(|n| n.parse::<u64>().ok())
                .is_some_and(|n| n <= rev_num);
            if covered {
                spec = spec.delete_path(path.clone());
            }
        }
        access.file.transact(spec).await?;
        tracing::info!(rev_num, "truncated caret log behind stored snapshot");
        Ok(())
    }
}

fn idle_check_interval() -> u64 {
    MAX_SESSION_IDLE.as_millis() as u64 / 4
}


#[cfg(test)]
mod control_tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::complex::FileComplex;
    use crate::memory::MemoryFile;
    use crate::store::File;

    async fn live_control() -> (Arc<ManualClock>, Arc<MemoryFile>, CaretControl) {
        crate::init_test_logging();
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        let file = Arc::new(MemoryFile::new());
        let complex = FileComplex::new(file.clone(), clock.clone());
        complex.init().await.unwrap();
        let carets = complex.carets().unwrap();
        (clock, file, carets)
    }

    #[async_std::test]
    async fn session_lifecycle_with_idle_sweep() {
        let (clock, _file, carets) = live_control().await;
        let s1: SessionId = "s1".into();
        let s2: SessionId = "s2".into();

        carets.update_caret(&s1, 1, 0, 0).await.unwrap();
        assert_eq!(carets.current_rev_num().await.unwrap(), 1);

        clock.set(Timestamp(1_100));
        carets.update_caret(&s2, 1, 3, 0).await.unwrap();
        assert_eq!(carets.current_rev_num().await.unwrap(), 2);

        let snapshot = carets.get_snapshot(None).await.unwrap();
        let color1 = snapshot.contents[&s1].color.clone();
        let color2 = snapshot.contents[&s2].color.clone();
        assert_ne!(color1, color2);

        // s1 has been idle past the limit; reading the snapshot kicks off
        // the sweeper
        clock.set(Timestamp(1_000).add_millis(MAX_SESSION_IDLE.as_millis() as u64 + 1));
        carets.get_snapshot(None).await.unwrap();
        let mut swept = false;
        for _ in 0..200 {
            if carets.current_rev_num().await.unwrap() == 3 {
                swept = true;
                break;
            }
            async_std::task::sleep(Duration::from_millis(5)).await;
        }
        assert!(swept, "idle sweep never landed");

        let snapshot = carets.get_snapshot(None).await.unwrap();
        assert!(!snapshot.contents.contains_key(&s1));
        assert_eq!(snapshot.contents[&s2].color, color2);
    }

    #[async_std::test]
    async fn position_reports_become_field_diffs() {
        let (clock, _file, carets) = live_control().await;
        let s1: SessionId = "s1".into();
        carets.update_caret(&s1, 1, 0, 0).await.unwrap();

        clock.advance(50);
        let correction = carets.update_caret(&s1, 2, 7, 0).await.unwrap();
        assert_eq!(correction.rev_num, 2);
        assert!(correction.delta.is_empty());

        let change = carets.get_change(2).await.unwrap();
        assert_eq!(
            change.delta.ops(),
            &[
                CaretOp::SetField(s1.clone(), CaretField::DocRevNum, 2),
                CaretOp::SetField(s1.clone(), CaretField::LastActive, 1_050),
                CaretOp::SetField(s1.clone(), CaretField::Index, 7),
            ]
        );
        let snapshot = carets.get_snapshot(None).await.unwrap();
        assert_eq!(snapshot.contents[&s1].index, 7);
    }

    #[async_std::test]
    async fn reap_removes_a_session_once() {
        let (_clock, _file, carets) = live_control().await;
        let s1: SessionId = "s1".into();
        carets.update_caret(&s1, 1, 0, 0).await.unwrap();

        carets.reap_session(&s1).await;
        assert_eq!(carets.current_rev_num().await.unwrap(), 2);
        assert!(carets
            .get_snapshot(None)
            .await
            .unwrap()
            .contents
            .is_empty());

        // reaping an absent session contributes no revision
        carets.reap_session(&s1).await;
        assert_eq!(carets.current_rev_num().await.unwrap(), 2);
    }

    #[async_std::test]
    async fn log_truncates_behind_a_stored_snapshot() {
        let (clock, file, carets) = live_control().await;
        let s1: SessionId = "s1".into();
        for index in 0..100 {
            clock.advance(10);
            carets.update_caret(&s1, 1, index, 0).await.unwrap();
        }
        assert_eq!(carets.current_rev_num().await.unwrap(), 100);

        let stored = StoragePath::stored_snapshot(CaretPart::NAME);
        let result = file
            .transact(TransactionSpec::new().read_path(stored.clone()))
            .await
            .unwrap();
        assert!(result.value(&stored).is_some(), "no stored snapshot written");
        assert!(matches!(
            carets.get_change(50).await,
            Err(Error::RevisionNotAvailable(50))
        ));

        // a fresh opener rebuilds the current view from the stored snapshot
        let complex = FileComplex::new(file, clock);
        complex.init().await.unwrap();
        let reopened = complex.carets().unwrap();
        let snapshot = reopened.get_snapshot(Some(100)).await.unwrap();
        assert_eq!(snapshot.contents[&s1].index, 99);
        assert!(matches!(
            reopened.get_snapshot(Some(10)).await,
            Err(Error::RevisionNotAvailable(_))
        ));
    }
}
