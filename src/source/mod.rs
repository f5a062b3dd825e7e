//! Source-of-truth providers: what upstream systems say the IDC tree should contain.
//!
//! Every provider is addressed the same way at every level: by the [Lineage] of a
//! node, whose depth determines the level.

mod dicom_folder;
mod manifest;
mod nbia;
mod token;

pub use dicom_folder::manifest_from_dicom_folder;
pub use manifest::{
    Manifest, ManifestCollection, ManifestInstance, ManifestPatient, ManifestSeries,
    ManifestSource, ManifestStudy,
};
pub use nbia::NbiaSource;
pub use token::TokenCache;

use crate::enums::{PerSource, SourceKind, Sources};
use crate::error::SourceError;
use crate::hashes::SourceHashes;
use crate::retry::RetryPolicy;
use crate::types::{BlobRef, Lineage, NaturalKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a source knows about one DICOM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Hex MD5 of the instance file.
    pub md5: String,
    /// Size in bytes.
    pub size: u64,
    /// Where the source keeps the file, if it is reachable through a [crate::BlobStore].
    pub blob: Option<BlobRef>,
    pub excluded: bool,
}

/// A source of truth for one [SourceKind].
pub trait SourceProvider: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Natural keys of the children of the node at `parent`, in the source's order.
    /// Duplicates are reported as-is. Unknown parents have no children.
    fn list_children(&self, parent: &Lineage) -> Result<Vec<NaturalKey>, SourceError>;

    /// The source's hierarchical hash of the node at `lineage`, empty if unknown.
    fn hash_of(&self, lineage: &Lineage) -> Result<String, SourceError>;

    /// Blob metadata of the instance at `lineage`.
    fn instance_metadata(&self, lineage: &Lineage) -> Result<BlobMetadata, SourceError>;

    /// DOIs under which the series of `collection` are cited. Sources which do not
    /// know any report none.
    fn collection_dois(&self, _collection: &NaturalKey) -> Result<CollectionDois, SourceError> {
        Ok(CollectionDois::default())
    }
}

/// Data collection DOIs of collections for which no source reports one.
const KNOWN_DATA_COLLECTION_DOIS: [(&str, &str); 7] = [
    ("NLST", "10.7937/TCIA.hmq8-j677"),
    ("Pancreatic-CT-CBCT-SEG", "10.7937/TCIA.ESHQ-4D90"),
    ("CPTAC-LSCC", "10.7937/K9/TCIA.2018.6EMUB5L2"),
    ("CPTAC-AML", "10.7937/tcia.2019.b6foe619"),
    ("CPTAC-BRCA", "10.7937/TCIA.CAEM-YS80"),
    ("CPTAC-COAD", "10.7937/TCIA.YZWQ-ZZ63"),
    ("CPTAC-OV", "10.7937/TCIA.ZS4A-JD58"),
];

/// The DOIs of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDois {
    /// DOI of the collection's original data, empty if unknown.
    pub data_collection_doi: String,
    /// DOIs of analysis results, by SeriesInstanceUID.
    pub analysis_collection_dois: BTreeMap<NaturalKey, String>,
}

impl CollectionDois {
    /// The DOI of a series: that of the analysis result it belongs to, if any,
    /// otherwise the collection's.
    pub fn source_doi(&self, series: &NaturalKey) -> &str {
        self.analysis_collection_dois
            .get(series)
            .unwrap_or(&self.data_collection_doi)
    }

    fn merge(&mut self, other: CollectionDois) {
        if self.data_collection_doi.is_empty() {
            self.data_collection_doi = other.data_collection_doi;
        }
        for (series, doi) in other.analysis_collection_dois {
            self.analysis_collection_dois.entry(series).or_insert(doi);
        }
    }
}

/// A child as listed by the union of all sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChild {
    pub key: NaturalKey,
    /// Which sources list this child.
    pub sources: Sources,
}

/// The union of every configured source. Calls go through the retry policy.
pub struct AllSources {
    providers: PerSource<Option<Arc<dyn SourceProvider>>>,
    retry: RetryPolicy,
}

impl AllSources {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            providers: PerSource::default(),
            retry,
        }
    }

    /// The same providers with another retry policy.
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Self {
            providers: self.providers.clone(),
            retry,
        }
    }

    /// Add a provider, replacing any previous provider of the same kind.
    pub fn with(mut self, provider: Arc<dyn SourceProvider>) -> Self {
        let kind = provider.kind();
        *self.providers.get_mut(kind) = Some(provider);
        self
    }

    pub fn provider(&self, kind: SourceKind) -> Option<&Arc<dyn SourceProvider>> {
        self.providers.get(kind).as_ref()
    }

    fn configured(&self) -> impl Iterator<Item = &Arc<dyn SourceProvider>> {
        SourceKind::ALL
            .into_iter()
            .filter_map(|kind| self.provider(kind))
    }

    /// Children of `parent` according to all sources, ordered by natural key.
    ///
    /// A key listed by several sources is merged into one child. A key listed more
    /// than once by the same source appears more than once, so that the caller can
    /// detect it.
    pub fn children(&self, parent: &Lineage) -> Result<Vec<SourceChild>, SourceError> {
        let mut merged: BTreeMap<NaturalKey, Vec<Sources>> = BTreeMap::new();
        for provider in self.configured() {
            let kind = provider.kind();
            let listing = self
                .retry
                .run("list_children", |_| provider.list_children(parent))?;
            for key in listing {
                let entries = merged.entry(key).or_default();
                match entries.iter_mut().find(|s| !*s.get(kind)) {
                    Some(sources) => *sources.get_mut(kind) = true,
                    None => entries.push(Sources::only(kind)),
                }
            }
        }
        Ok(merged
            .into_iter()
            .flat_map(|(key, entries)| {
                entries.into_iter().map(move |sources| SourceChild {
                    key: key.clone(),
                    sources,
                })
            })
            .collect())
    }

    /// Per-source hashes of the node at `lineage`. Unconfigured sources hash to "".
    pub fn src_hashes(&self, lineage: &Lineage) -> Result<SourceHashes, SourceError> {
        let mut hashes = SourceHashes::default();
        for provider in self.configured() {
            *hashes.get_mut(provider.kind()) =
                self.retry.run("hash_of", |_| provider.hash_of(lineage))?;
        }
        Ok(hashes)
    }

    /// DOIs of `collection` according to all sources, radiology first.
    pub fn collection_dois(&self, collection: &NaturalKey) -> Result<CollectionDois, SourceError> {
        let mut dois = CollectionDois::default();
        for provider in self.configured() {
            dois.merge(
                self.retry
                    .run("collection_dois", |_| provider.collection_dois(collection))?,
            );
        }
        if dois.data_collection_doi.is_empty() {
            match KNOWN_DATA_COLLECTION_DOIS
                .iter()
                .find(|(id, _)| *id == collection.as_str())
            {
                Some((_, doi)) => dois.data_collection_doi = doi.to_string(),
                None => tracing::warn!(collection = collection.as_str(), "no DOI for collection"),
            }
        }
        Ok(dois)
    }

    pub fn instance_metadata(
        &self,
        lineage: &Lineage,
        kind: SourceKind,
    ) -> Result<BlobMetadata, SourceError> {
        let provider = self.provider(kind).ok_or_else(|| SourceError::Unknown {
            source_kind: kind,
            level: crate::enums::Level::Instance,
            lineage: lineage.clone(),
        })?;
        self.retry
            .run("instance_metadata", |_| provider.instance_metadata(lineage))
    }
}
