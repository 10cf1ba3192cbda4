use crate::change::Snapshot;
use crate::complex::FileAccess;
use crate::control::{self, Part};
use crate::error::{Result, RevNum};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type SharedSnapshot<P> =
    Shared<BoxFuture<'static, Result<Snapshot<<P as Part>::Contents>>>>;

/// Per-control cache of in-flight and settled snapshot materializations.
///
/// Entries are shared futures: the first caller for a revision installs
/// the future and every concurrent caller for the same revision awaits
/// the same work. A new revision's materialization starts from the
/// nearest cached revision at or below it, falling back to an ephemeral
/// part's stored snapshot and finally to the empty contents at revision 0.
pub(crate) struct SnapshotManager<P: Part> {
    access: FileAccess,
    cache: Arc<Mutex<BTreeMap<RevNum, SharedSnapshot<P>>>>,
}

impl<P: Part> Clone for SnapshotManager<P> {
    fn clone(&self) -> Self {
        Self {
            access: self.access.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<P: Part> SnapshotManager<P> {
    pub(crate) fn new(access: FileAccess) -> Self {
        Self {
            access,
            cache: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the snapshot at `rev_num`, which the caller has already
    /// range-checked against the current revision.
    pub(crate) async fn get(&self, rev_num: RevNum) -> Result<Snapshot<P::Contents>> {
        let fut = {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.get(&rev_num) {
                hit.clone()
            } else {
                let base = cache
                    .range(..rev_num)
                    .next_back()
                    .map(|(_, fut)| fut.clone());
                let fut = materialize::<P>(self.access.clone(), base, rev_num)
                    .boxed()
                    .shared();
                cache.insert(rev_num, fut.clone());
                fut
            }
        };
        let result = fut.await;
        if result.is_err() {
            // a failed materialization must not poison the revision
            self.cache.lock().remove(&rev_num);
        }
        result
    }

    /// Drops every cached entry; used when the file is re-initialized.
    pub(crate) fn clear(&self) {
        self.cache.lock().clear();
    }
}

async fn materialize<P: Part>(
    access: FileAccess,
    base: Option<SharedSnapshot<P>>,
    rev_num: RevNum,
) -> Result<Snapshot<P::Contents>> {
    let base = match base {
        Some(fut) => Some(fut.await?),
        None => control::read_stored_snapshot::<P>(&access)
            .await?
            .filter(|snapshot| snapshot.rev_num <= rev_num),
    };
    let (base, from_empty) = match base {
        Some(snapshot) => (snapshot, false),
        None => (Snapshot::new(0, P::empty_contents()), true),
    };
    let span = rev_num - base.rev_num;
    if from_empty {
        tracing::info!(part = P::NAME, rev_num, "making snapshot from scratch");
    } else if span == 1 {
        tracing::info!(part = P::NAME, rev_num, "making snapshot from adjacent revision");
    } else if span > 1 {
        tracing::info!(
            part = P::NAME,
            rev_num,
            base = base.rev_num,
            "making snapshot from composed span"
        );
    }
    let contents =
        control::composed_contents::<P>(&access, base.contents, base.rev_num + 1, rev_num + 1)
            .await?;
    Ok(Snapshot::new(rev_num, contents))
}
