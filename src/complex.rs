use crate::body::BodyControl;
use crate::bootstrap::FileBootstrap;
use crate::caret::CaretControl;
use crate::clock::{Clock, Timestamp};
use crate::codec::Codec;
use crate::error::Result;
use crate::prop::PropertyControl;
use crate::store::File;
use std::sync::Arc;

/// Everything a control needs to reach its document: the file handle,
/// the value codec, and the clock.
///
/// Constructed once per document and threaded into every control; controls
/// never reach back through their container for utilities.
#[derive(Clone)]
pub struct FileAccess {
    pub(crate) file: Arc<dyn File>,
    pub(crate) codec: Codec,
    pub(crate) clock: Arc<dyn Clock>,
}

impl FileAccess {
    /// Bundles a file with the codec and clock.
    pub fn new(file: Arc<dyn File>, codec: Codec, clock: Arc<dyn Clock>) -> Self {
        Self { file, codec, clock }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// Per-document container of the three controls and their bootstrap.
///
/// A complex has no mutable state of its own; it is usually held behind
/// an `Arc` owned weakly by the [`DocServer`](crate::server::DocServer)
/// cache, so idle documents are reclaimable.
pub struct FileComplex {
    access: FileAccess,
    bootstrap: FileBootstrap,
}

impl FileComplex {
    /// Wires up a complex over a file handle.
    pub fn new(file: Arc<dyn File>, clock: Arc<dyn Clock>) -> Self {
        let access = FileAccess::new(file, Codec, clock);
        let bootstrap = FileBootstrap::new(access.clone());
        Self { access, bootstrap }
    }

    pub(crate) fn access(&self) -> &FileAccess {
        &self.access
    }

    /// The bootstrap coordinator.
    pub fn bootstrap(&self) -> &FileBootstrap {
        &self.bootstrap
    }

    /// Validates the file on first access and repairs it if necessary.
    pub async fn init(&self) -> Result<()> {
        self.bootstrap.init().await
    }

    /// The body control; fails *BadUse* before [`init`](Self::init) completes.
    pub fn body(&self) -> Result<BodyControl> {
        self.bootstrap.body()
    }

    /// The caret control; fails *BadUse* before [`init`](Self::init) completes.
    pub fn carets(&self) -> Result<CaretControl> {
        self.bootstrap.carets()
    }

    /// The property control; fails *BadUse* before [`init`](Self::init) completes.
    pub fn properties(&self) -> Result<PropertyControl> {
        self.bootstrap.properties()
    }
}
