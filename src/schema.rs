use crate::complex::FileAccess;
use crate::error::Result;
use crate::path::StoragePath;
use crate::store::TransactionSpec;

/// The format version this build reads and writes.
pub const SCHEMA_VERSION: &str = "2";

/// Verdict of a validation pass over stored state.
///
/// Storage errors never escape validation; they collapse into
/// [`ValidationStatus::Error`] so bootstrap can decide what to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationStatus {
    /// The stored state is usable as-is.
    Ok,
    /// The file does not exist.
    NotFound,
    /// The file was written by a different format version.
    Migrate,
    /// The stored state is missing pieces or undecodable.
    Error,
}

/// Owns the `/schema_version` key.
pub struct SchemaHandler {
    access: FileAccess,
}

impl SchemaHandler {
    pub(crate) fn new(access: FileAccess) -> Self {
        Self { access }
    }

    /// Checks the stored format version.
    pub async fn validate(&self) -> ValidationStatus {
        self.validate_inner()
            .await
            .unwrap_or(ValidationStatus::Error)
    }

    async fn validate_inner(&self) -> Result<ValidationStatus> {
        if !self.access.file.exists().await? {
            return Ok(ValidationStatus::NotFound);
        }
        let path = StoragePath::schema_version();
        let result = self
            .access
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await?;
        Ok(match result.value(&path) {
            None => ValidationStatus::Error,
            Some(bytes) => match self.access.codec.decode::<String>(bytes) {
                Ok(version) if version == SCHEMA_VERSION => ValidationStatus::Ok,
                Ok(_) => ValidationStatus::Migrate,
                Err(_) => ValidationStatus::Error,
            },
        })
    }

    /// Appends the schema write to a bootstrap transaction.
    pub(crate) fn init_spec(&self, spec: TransactionSpec) -> Result<TransactionSpec> {
        let value = self.access.codec.encode(&SCHEMA_VERSION)?;
        Ok(spec.write_path(StoragePath::schema_version(), value))
    }
}
