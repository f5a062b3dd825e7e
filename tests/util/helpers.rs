use idc_etl::source::{AllSources, BlobMetadata, Manifest, ManifestSource, SourceProvider};
use idc_etl::store::{JsonStore, MetadataStore};
use idc_etl::{
    EtlError, ExecutionContext, IdcVersion, Level, Lineage, NaturalKey, RetryPolicy, SourceError,
    SourceKind, VersionedNode, build_version,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

static INIT_LOGGING: Once = Once::new();

pub(crate) fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish(),
        )
        .unwrap()
    })
}

pub(crate) fn radiology(manifest: &Manifest) -> Arc<AllSources> {
    Arc::new(
        AllSources::new(RetryPolicy::once())
            .with(Arc::new(ManifestSource::new(SourceKind::Tcia, manifest))),
    )
}

pub(crate) fn sources_of(provider: impl SourceProvider + 'static) -> Arc<AllSources> {
    Arc::new(AllSources::new(RetryPolicy::once()).with(Arc::new(provider)))
}

pub(crate) fn in_memory_store() -> Arc<JsonStore> {
    Arc::new(JsonStore::in_memory())
}

/// Build `version` on top of `version - 1`, sequentially.
pub(crate) fn build(
    store: &Arc<JsonStore>,
    sources: &Arc<AllSources>,
    version: IdcVersion,
) -> Result<VersionedNode, EtlError> {
    build_with(store, sources, ExecutionContext::new(version, version - 1))
}

pub(crate) fn build_with(
    store: &Arc<JsonStore>,
    sources: &Arc<AllSources>,
    ctx: ExecutionContext,
) -> Result<VersionedNode, EtlError> {
    let store: Arc<dyn MetadataStore> = store.clone();
    build_version(&ctx, sources, &store)
}

/// Follow natural keys down from the version root.
pub(crate) fn find<'a>(root: &'a VersionedNode, keys: &[&str]) -> &'a VersionedNode {
    keys.iter().fold(root, |node, key| {
        node.child(&NaturalKey::from(*key))
            .unwrap_or_else(|| panic!("{key} not found under {}", node.key()))
    })
}

pub(crate) fn lineage(keys: &[&str]) -> Lineage {
    keys.iter().copied().collect()
}

/// Every uuid of a tree, parents first.
pub(crate) fn uuids(root: &VersionedNode) -> Vec<uuid::Uuid> {
    let mut uuids = Vec::new();
    root.walk(&mut |n| uuids.push(n.record.uuid));
    uuids
}

/// A source which fails to describe one instance while armed.
pub(crate) struct FailingInstance {
    pub inner: ManifestSource,
    pub fail_on: Lineage,
    pub armed: AtomicBool,
}

impl FailingInstance {
    pub fn new(manifest: &Manifest, fail_on: Lineage) -> Self {
        Self {
            inner: ManifestSource::new(SourceKind::Tcia, manifest),
            fail_on,
            armed: AtomicBool::new(true),
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl SourceProvider for FailingInstance {
    fn kind(&self) -> SourceKind {
        SourceKind::Tcia
    }

    fn list_children(&self, parent: &Lineage) -> Result<Vec<NaturalKey>, SourceError> {
        self.inner.list_children(parent)
    }

    fn hash_of(&self, lineage: &Lineage) -> Result<String, SourceError> {
        self.inner.hash_of(lineage)
    }

    fn instance_metadata(&self, lineage: &Lineage) -> Result<BlobMetadata, SourceError> {
        if *lineage == self.fail_on && self.armed.load(Ordering::SeqCst) {
            return Err(SourceError::Unknown {
                source_kind: SourceKind::Tcia,
                level: Level::Instance,
                lineage: lineage.clone(),
            });
        }
        self.inner.instance_metadata(lineage)
    }
}

/// A source whose hash of one node disagrees with its own listing.
pub(crate) struct WrongHash {
    pub inner: ManifestSource,
    pub lineage: Lineage,
}

impl SourceProvider for WrongHash {
    fn kind(&self) -> SourceKind {
        SourceKind::Tcia
    }

    fn list_children(&self, parent: &Lineage) -> Result<Vec<NaturalKey>, SourceError> {
        self.inner.list_children(parent)
    }

    fn hash_of(&self, lineage: &Lineage) -> Result<String, SourceError> {
        if *lineage == self.lineage {
            Ok("00000000000000000000000000000000".to_string())
        } else {
            self.inner.hash_of(lineage)
        }
    }

    fn instance_metadata(&self, lineage: &Lineage) -> Result<BlobMetadata, SourceError> {
        self.inner.instance_metadata(lineage)
    }
}
