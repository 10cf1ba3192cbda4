//! # The coauthor document coordination engine
//!
//! This crate is the server-side control plane of a real-time
//! collaborative rich-text editor. Many concurrent sessions edit the same
//! document; each one submits edits and caret movements against some
//! historical revision, and the engine linearizes them into a single
//! monotone revision history, returning each submitter a *correction*
//! that converges its optimistic local state on the authoritative one
//! without discarding what the user typed.
//!
//! ## Parts
//! A document is three independent revision histories sharing one
//! transactional key-value file:
//!
//! - **body** — the durable text, as rich-text deltas
//!   (`retain`/`insert`/`delete` with attributes).
//! - **caret** — ephemeral per-session carets and selections; history is
//!   truncated behind a stored snapshot.
//! - **prop** — durable key-value metadata.
//!
//! Each part has its own revision space. Revision 0 is the empty change
//! over the empty contents; the change numbered `r` rewrites the snapshot
//! at `r - 1` into the snapshot at `r`, and no committed change is empty.
//!
//! ## The update protocol
//! `update` is the heart of the engine. A change arrives carrying the
//! revision the client edited against. If that base is still the head,
//! the change is appended as-is. Otherwise the client's delta is rebased
//! over everything that landed in between: the body transforms it
//! positionally (the server winning insert-position ties), the keyed
//! parts replay and diff. Appends are guarded by storage preconditions,
//! so any number of writers — in this process or another one sharing the
//! file — can race; losers observe a failed precondition and retry with
//! exponential backoff until a wall-clock budget runs out.
//!
//! ## Storage
//! The engine owns the layout of the file but not the file itself: any
//! store that offers atomic multi-op transactions with preconditions and
//! a suspending "wait until this path changes" read satisfies
//! [`File`]/[`FileStore`]. [`MemoryFileStore`] is the bundled in-memory
//! implementation.
//!
//! ## Entry points
//! A [`DocServer`] hands out per-document [`FileComplex`]es through a
//! weak-valued cache. The complex bootstraps the file on first access —
//! re-initializing it with an explanatory preamble if it is missing,
//! outdated, or corrupt — and then exposes the three controls.

#![warn(missing_docs)]

mod body;
mod bootstrap;
mod caret;
mod change;
mod clock;
mod codec;
mod complex;
mod control;
mod error;
mod id;
mod memory;
mod path;
mod prop;
#[cfg(test)]
mod props;
mod schema;
mod server;
mod snapshot;
mod store;
mod text;

pub use crate::body::{BodyControl, BodyPart};
pub use crate::bootstrap::FileBootstrap;
pub use crate::caret::{
    Caret, CaretControl, CaretDelta, CaretField, CaretMap, CaretOp, CaretPart, Color,
    MAX_SESSION_IDLE,
};
pub use crate::change::{Change, Snapshot};
pub use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use crate::codec::Codec;
pub use crate::complex::{FileAccess, FileComplex};
pub use crate::control::{
    Control, Part, RebaseMode, INITIAL_APPEND_RETRY, MAX_APPEND_TIME,
    MAX_CHANGE_READS_PER_TRANSACTION,
};
pub use crate::error::{Error, Result, RevNum};
pub use crate::id::{AuthorId, DocId, SessionId};
pub use crate::memory::{MemoryFile, MemoryFileStore};
pub use crate::path::StoragePath;
pub use crate::prop::{PropDelta, PropMap, PropOp, PropPart, PropertyControl};
pub use crate::schema::{SchemaHandler, ValidationStatus, SCHEMA_VERSION};
pub use crate::server::DocServer;
pub use crate::store::{
    File, FileStore, StoreOp, TransactionResult, TransactionSpec, DEFAULT_WAIT_TIMEOUT,
};
pub use crate::text::{Attrs, TextDelta, TextOp};

/// Installs a stderr `tracing` subscriber honoring `RUST_LOG`. Safe to
/// call from every test; only the first installation wins.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
