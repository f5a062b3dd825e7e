//! Version-tracking core of the Imaging Data Commons ETL.
//!
//! Each run builds one IDC version: the collection/patient/study/series/instance
//! tree is diffed against the previous version and against the sources of truth,
//! producing new rows only for what changed.
mod blob;
mod builder;
mod config;
mod context;
mod distributor;
mod enums;
mod error;
mod hashes;
mod node;
mod retry;
mod run_from_env;
mod run_log;
mod sanitize;
mod settings;
pub mod source;
pub mod store;
mod types;
mod validation;
mod versioner;
mod views;

pub use blob::{BlobStore, LocalBlobStore, empty_bucket};
pub use builder::{build_collection, build_instance, build_patient, build_series, build_study, build_version};
pub use config::get_config;
pub use context::ExecutionContext;
pub use distributor::{CancelToken, DistributeError, WorkDistributor};
pub use enums::{Level, PerSource, SourceKind, Sources};
pub use error::{
    BatchCancelled, BlobError, DuplicateChildError, EtlError, HashValidationError, Retryable, SourceError, StoreError,
};
pub use hashes::{Hashes, SourceHashes, combine, md5_hex, merkle_hash};
pub use node::{Details, InstanceDetails, NodeRecord, VersionedNode};
pub use retry::RetryPolicy;
pub use run_from_env::{run_etl, settings_from_env};
pub use run_log::SuccessLog;
pub use settings::{EtlSettings, SourceSettings};
pub use types::{BlobName, BlobRef, BucketName, IdcVersion, Lineage, NaturalKey};
pub use validation::{Finding, Problem, compare_with_sources, validate_tree};
pub use versioner::{EntityVersioner, ExpandSummary, Partition, partition};
pub use views::{PublishedInstance, published_instances};
