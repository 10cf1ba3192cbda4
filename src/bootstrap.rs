use crate::body::BodyControl;
use crate::caret::CaretControl;
use crate::change::Change;
use crate::complex::FileAccess;
use crate::control::Control;
use crate::error::{Error, Result};
use crate::prop::PropertyControl;
use crate::schema::{SchemaHandler, ValidationStatus};
use crate::store::TransactionSpec;
use crate::text::TextDelta;
use std::sync::atomic::{AtomicBool, Ordering};

/// Body text of a freshly created document.
const DEFAULT_PREAMBLE: &str = "Welcome to your new document!\n";

/// Body text left behind when a schema migration reset the file.
const MIGRATE_PREAMBLE: &str =
    "This document was reset because its storage format was out of date.\n";

/// Body text left behind when corrupt storage forced a reset.
const RECOVER_PREAMBLE: &str =
    "This document was reset after a storage error; its previous contents could not be recovered.\n";

/// Coordinates first-access setup of a document file.
///
/// `init` runs at most once concurrently per file (a single-entry async
/// mutex) and at most once effectively per instance. The three controls
/// exist from construction but are handed out only after `init` decides
/// the file is usable.
pub struct FileBootstrap {
    access: FileAccess,
    schema: SchemaHandler,
    body: BodyControl,
    carets: CaretControl,
    properties: PropertyControl,
    ready: AtomicBool,
    entry: futures::lock::Mutex<()>,
}

impl FileBootstrap {
    pub(crate) fn new(access: FileAccess) -> Self {
        Self {
            schema: SchemaHandler::new(access.clone()),
            body: Control::new(access.clone()),
            carets: CaretControl::new(access.clone()),
            properties: Control::new(access.clone()),
            access,
            ready: AtomicBool::new(false),
            entry: futures::lock::Mutex::new(()),
        }
    }

    /// Validates the stored state, re-initializing the file with an
    /// explanatory preamble when it is missing, out of date, or corrupt.
    pub async fn init(&self) -> Result<()> {
        let _entry = self.entry.lock().await;
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let status = self.overall_status().await;
        if status != ValidationStatus::Ok {
            self.reinitialize(status).await?;
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Schema verdict first; only a schema-valid file gets its body log
    /// walked.
    async fn overall_status(&self) -> ValidationStatus {
        match self.schema.validate().await {
            ValidationStatus::Ok => self.body.validate().await,
            status => status,
        }
    }

    async fn reinitialize(&self, status: ValidationStatus) -> Result<()> {
        let preamble = match status {
            ValidationStatus::NotFound => DEFAULT_PREAMBLE,
            ValidationStatus::Migrate => MIGRATE_PREAMBLE,
            ValidationStatus::Error => RECOVER_PREAMBLE,
            ValidationStatus::Ok => {
                return Err(Error::Wtf("reinitializing a valid file".into()))
            }
        };
        tracing::info!(?status, "initializing document file");
        self.access.file.create().await?;
        let mut spec = TransactionSpec::new().delete_all();
        spec = self.schema.init_spec(spec)?;
        spec = self.body.init_spec(spec)?;
        spec = self.carets.control().init_spec(spec)?;
        spec = self.properties.init_spec(spec)?;
        self.access.file.transact(spec).await?;
        self.body.clear_snapshots();
        self.carets.control().clear_snapshots();
        self.properties.clear_snapshots();
        let first = Change::new(
            1,
            TextDelta::new().insert(preamble, None),
            self.access.now(),
            None,
        );
        self.body.update(first).await?;
        Ok(())
    }

    fn check_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::bad_use("file bootstrap has not completed"))
        }
    }

    /// The body control; fails *BadUse* before `init` completes.
    pub fn body(&self) -> Result<BodyControl> {
        self.check_ready()?;
        Ok(self.body.clone())
    }

    /// The caret control; fails *BadUse* before `init` completes.
    pub fn carets(&self) -> Result<CaretControl> {
        self.check_ready()?;
        Ok(self.carets.clone())
    }

    /// The property control; fails *BadUse* before `init` completes.
    pub fn properties(&self) -> Result<PropertyControl> {
        self.check_ready()?;
        Ok(self.properties.clone())
    }
}
