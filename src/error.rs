use crate::enums::{Level, SourceKind};
use crate::hashes::SourceHashes;
use crate::types::{BlobRef, Lineage, NaturalKey};
use std::time::Duration;
use uuid::Uuid;

/// Whether an error is worth retrying.
pub trait Retryable {
    /// Transient errors (timeouts, rate limits, lock contention) may succeed on a
    /// later attempt. Everything else must propagate immediately.
    fn is_transient(&self) -> bool;
}

/// Any failure while building an IDC version.
#[derive(thiserror::Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateChildError),

    #[error(transparent)]
    HashValidation(#[from] HashValidationError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("No results from workers within {waited:?}, batch abandoned")]
    BatchTimeout { waited: Duration },

    #[error("A worker thread exited without reporting its result")]
    WorkerLost,

    #[error(transparent)]
    Cancelled(#[from] BatchCancelled),

    #[error("{level} {lineage} cannot be built by its parent")]
    Misplaced { level: Level, lineage: Lineage },
}

impl Retryable for EtlError {
    fn is_transient(&self) -> bool {
        match self {
            EtlError::Duplicate(_) | EtlError::HashValidation(_) => false,
            EtlError::Source(e) => e.is_transient(),
            EtlError::Store(e) => e.is_transient(),
            EtlError::Blob(e) => e.is_transient(),
            EtlError::BatchTimeout { .. }
            | EtlError::WorkerLost
            | EtlError::Cancelled(_)
            | EtlError::Misplaced { .. } => false,
        }
    }
}

/// The batch a task belongs to was abandoned, so its work must not be committed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Batch was abandoned")]
pub struct BatchCancelled;

/// A source listed the same child more than once.
#[derive(thiserror::Error, Debug)]
#[error("Duplicate {level} in expansion of {parent:?}: {duplicates:?}")]
pub struct DuplicateChildError {
    pub level: Level,
    pub parent: Lineage,
    pub duplicates: Vec<NaturalKey>,
}

/// The hash computed bottom-up from the IDC tree disagrees with the source.
#[derive(thiserror::Error, Debug)]
#[error("Hash match failed for {level} {lineage}: idc={idc:?} source={source_side:?}")]
pub struct HashValidationError {
    pub level: Level,
    pub lineage: Lineage,
    pub idc: SourceHashes,
    pub source_side: SourceHashes,
}

/// Error from a source-of-truth provider.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("({status:?} {reason:?}) from {source_kind} for {url}: {text:?}")]
    Status {
        source_kind: SourceKind,
        url: String,
        status: reqwest::StatusCode,
        reason: &'static str,
        text: Option<String>,
    },

    #[error("{source_kind} does not know {level} {lineage}")]
    Unknown {
        source_kind: SourceKind,
        level: Level,
        lineage: Lineage,
    },

    #[error("Could not read manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("Could not read DICOM file {path}: {message}")]
    Dicom { path: String, message: String },

    #[error("DICOM file {path} does not have the required tag \"{tag}\"")]
    MissingTag { path: String, tag: &'static str },
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            SourceError::Request(e) => e.is_timeout() || e.is_connect(),
            SourceError::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            SourceError::IO(_) => true,
            SourceError::Walk(e) => e.loop_ancestor().is_none() && e.io_error().is_some(),
            SourceError::Unknown { .. }
            | SourceError::Manifest(_)
            | SourceError::Dicom { .. }
            | SourceError::MissingTag { .. } => false,
        }
    }
}

/// Error from the ETL metadata store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Corrupt store file: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No row with uuid {0}")]
    MissingRow(Uuid),

    #[error("Version {0} does not exist in the store")]
    MissingVersion(u32),

    #[error("Store lock was poisoned by a panicking worker")]
    Poisoned,

    #[error(transparent)]
    Cancelled(#[from] BatchCancelled),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::IO(_))
    }
}

/// Error from a [crate::BlobStore].
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("Blob not found: {0}")]
    NotFound(BlobRef),
}

impl Retryable for BlobError {
    fn is_transient(&self) -> bool {
        match self {
            BlobError::IO(_) => true,
            BlobError::Walk(e) => e.loop_ancestor().is_none() && e.io_error().is_some(),
            BlobError::NotFound(_) => false,
        }
    }
}

/// Turn a non-success HTTP response into a [SourceError].
pub(crate) fn check(
    source_kind: SourceKind,
    res: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, SourceError> {
    let status = res.status();
    if status.is_success() {
        Ok(res)
    } else {
        let url = res.url().to_string();
        let reason = status.canonical_reason().unwrap_or("unknown reason");
        let text = res.text().ok();
        Err(SourceError::Status {
            source_kind,
            url,
            status,
            reason,
            text,
        })
    }
}
