use super::complete;
use crate::context::ExecutionContext;
use crate::enums::{Level, SourceKind, Sources};
use crate::error::EtlError;
use crate::hashes::Hashes;
use crate::node::VersionedNode;
use crate::sanitize::prestaging_bucket;
use crate::source::{AllSources, BlobMetadata};
use crate::store::Session;
use crate::types::{BlobRef, Lineage};
use crate::versioner::EntityVersioner;

/// Expand a series, fetch the metadata of its undone instances and complete it.
///
/// Instances are leaves: they are saved and committed together with their series.
pub fn build_series(
    ctx: &ExecutionContext,
    sources: &AllSources,
    sess: &mut Session,
    series: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    if series.record.done {
        return Ok(());
    }
    if !series.record.expanded {
        EntityVersioner::new(ctx, sources).expand(sess, series, lineage)?;
    }
    for instance in series.children.iter_mut().filter(|c| !c.record.done) {
        ctx.cancel.check()?;
        let instance_lineage = lineage.child(instance.key());
        build_instance(ctx, sources, instance, &instance_lineage)?;
    }
    complete(ctx, sources, sess, series, lineage)
}

/// Fill in an instance from its own source and stage its blob.
///
/// The instance is only modified in memory; its series saves it.
pub fn build_instance(
    ctx: &ExecutionContext,
    sources: &AllSources,
    instance: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    let kind = instance
        .record
        .instance_details()
        .map(|d| d.source)
        .unwrap_or(SourceKind::Tcia);
    let metadata = sources.instance_metadata(lineage, kind)?;
    if let Some(blob) = &metadata.blob {
        stage_blob(ctx, instance, lineage, blob)?;
    }
    let BlobMetadata {
        md5, size, excluded, ..
    } = metadata;
    let record = &mut instance.record;
    if let Some(details) = record.instance_details_mut() {
        details.size = size;
        details.excluded = excluded;
    }
    record.hashes = Some(Hashes::leaf(kind, md5));
    record.sources = Sources::only(kind);
    record.touch();
    record.done = true;
    record.expanded = true;
    Ok(())
}

/// Copy an instance's blob to `{uuid}.dcm` in its collection's prestaging bucket,
/// unless a previous run already did.
fn stage_blob(
    ctx: &ExecutionContext,
    instance: &VersionedNode,
    lineage: &Lineage,
    blob: &BlobRef,
) -> Result<(), EtlError> {
    let (Some(store), Some(collection_id)) = (&ctx.blob_store, lineage.keys().first()) else {
        return Ok(());
    };
    let uuid = instance.record.uuid.to_string();
    if ctx.success_log.contains(Level::Instance, &uuid) {
        return Ok(());
    }
    let dst = BlobRef::new(
        prestaging_bucket(&ctx.prestaging_bucket_prefix, collection_id),
        format!("{uuid}.dcm"),
    );
    ctx.cancel.check()?;
    ctx.retry.run("copy_blob", |_| store.copy(blob, &dst))?;
    ctx.success_log.record(Level::Instance, &uuid);
    tracing::debug!(worker = ctx.worker, src = %blob, dst = %dst, "staged blob");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, LocalBlobStore};
    use crate::node::{Details, NodeRecord};
    use crate::retry::RetryPolicy;
    use crate::source::{
        Manifest, ManifestCollection, ManifestInstance, ManifestPatient, ManifestSeries,
        ManifestSource, ManifestStudy,
    };
    use crate::store::{JsonStore, MetadataStore};
    use crate::types::{BucketName, NaturalKey};
    use camino::Utf8Path;
    use std::sync::Arc;

    fn manifest(instances: Vec<ManifestInstance>) -> Manifest {
        Manifest {
            collections: vec![ManifestCollection {
                collection_id: NaturalKey::from_static("TCGA-LUAD"),
                doi: None,
                patients: vec![ManifestPatient {
                    submitter_case_id: NaturalKey::from_static("P1"),
                    studies: vec![ManifestStudy {
                        study_instance_uid: NaturalKey::from_static("1.1"),
                        series: vec![ManifestSeries {
                            series_instance_uid: NaturalKey::from_static("1.1.1"),
                            source_doi: None,
                            instances,
                        }],
                    }],
                }],
            }],
        }
    }

    fn instance(uid: &str, md5: &str, blob: Option<BlobRef>) -> ManifestInstance {
        ManifestInstance {
            sop_instance_uid: NaturalKey::from(uid),
            md5: md5.to_string(),
            size: 42,
            blob,
            excluded: false,
        }
    }

    fn series_lineage() -> Lineage {
        ["TCGA-LUAD", "P1", "1.1", "1.1.1"].into_iter().collect()
    }

    fn new_series(version: u32) -> VersionedNode {
        VersionedNode::new(NodeRecord::new(
            Level::Series,
            NaturalKey::from_static("1.1.1"),
            version,
            Details::fresh(Level::Series, SourceKind::Tcia, version - 1),
        ))
    }

    #[test]
    fn test_build_series_from_scratch() {
        let manifest = manifest(vec![instance("1.1.1.2", "bb", None), instance("1.1.1.1", "aa", None)]);
        let sources = AllSources::new(RetryPolicy::once())
            .with(Arc::new(ManifestSource::new(SourceKind::Tcia, &manifest)));
        let store = Arc::new(JsonStore::in_memory());
        let mut sess = Session::new(store.clone());
        let ctx = ExecutionContext::new(1, 0);
        let mut series = new_series(1);
        sess.save(&series);
        sess.commit().unwrap();

        build_series(&ctx, &sources, &mut sess, &mut series, &series_lineage()).unwrap();

        assert!(series.record.done);
        assert_eq!(
            series.record.details,
            Details::Series {
                series_instances: 2,
                source_doi: String::new(),
            }
        );
        let hashes = series.record.hashes.as_ref().unwrap();
        assert_eq!(hashes.per_source.tcia, crate::hashes::md5_hex(b"aabb"));
        let first = &series.children[0].record;
        assert_eq!(first.instance_details().map(|d| d.size), Some(42));

        let stored = crate::store::load_subtree(store.as_ref(), series.record.uuid).unwrap();
        assert_eq!(stored, series);
        assert!(store.row(first.uuid).unwrap().unwrap().0.done);
    }

    #[test]
    fn test_blobs_staged_once() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(Utf8Path::from_path(dir.path()).unwrap()));
        let src = BlobRef::new("tcia", "1.1.1.1.dcm");
        fs_err::create_dir_all(dir.path().join("tcia")).unwrap();
        fs_err::write(blobs.path_of(&src), b"DICM").unwrap();

        let manifest = manifest(vec![instance("1.1.1.1", "aa", Some(src))]);
        let sources = AllSources::new(RetryPolicy::once())
            .with(Arc::new(ManifestSource::new(SourceKind::Tcia, &manifest)));
        let store = Arc::new(JsonStore::in_memory());
        let mut sess = Session::new(store.clone());
        let ctx = ExecutionContext::new(1, 0).with_blob_store(blobs.clone(), "pre_");
        let mut series = new_series(1);
        sess.save(&series);
        sess.commit().unwrap();
        build_series(&ctx, &sources, &mut sess, &mut series, &series_lineage()).unwrap();

        let uuid = series.children[0].record.uuid;
        let bucket = BucketName::from_static("pre_tcga_luad");
        let staged = BlobRef::new(bucket.clone(), format!("{uuid}.dcm"));
        assert!(blobs.exists(&staged).unwrap());
        assert!(ctx.success_log.contains(Level::Instance, &uuid.to_string()));

        // a second attempt does not copy again
        blobs.delete(&staged).unwrap();
        build_instance(
            &ctx,
            &sources,
            &mut series.children[0],
            &series_lineage().child(&NaturalKey::from_static("1.1.1.1")),
        )
        .unwrap();
        assert!(blobs.list(&bucket).unwrap().is_empty());
    }

    #[test]
    fn test_series_cited_under_collection_doi() {
        let manifest = manifest(vec![instance("1.1.1.1", "aa", None)]);
        let sources = AllSources::new(RetryPolicy::once())
            .with(Arc::new(ManifestSource::new(SourceKind::Tcia, &manifest)));
        let store = Arc::new(JsonStore::in_memory());
        let mut sess = Session::new(store.clone());
        let ctx = ExecutionContext::new(1, 0).with_collection_dois(crate::source::CollectionDois {
            data_collection_doi: "10.7937/K9/TCIA.2016.JGNIHEP5".to_string(),
            ..Default::default()
        });
        let mut series = new_series(1);
        build_series(&ctx, &sources, &mut sess, &mut series, &series_lineage()).unwrap();
        assert!(matches!(
            &series.record.details,
            Details::Series { source_doi, .. } if source_doi == "10.7937/K9/TCIA.2016.JGNIHEP5"
        ));
    }

    #[test]
    fn test_cancelled_series_is_not_built() {
        let manifest = manifest(vec![instance("1.1.1.1", "aa", None)]);
        let sources = AllSources::new(RetryPolicy::once())
            .with(Arc::new(ManifestSource::new(SourceKind::Tcia, &manifest)));
        let store = Arc::new(JsonStore::in_memory());
        let mut sess = Session::new(store.clone());
        let ctx = ExecutionContext::new(1, 0);
        let mut series = new_series(1);
        sess.save(&series);
        sess.commit().unwrap();
        EntityVersioner::new(&ctx, &sources)
            .expand(&mut sess, &mut series, &series_lineage())
            .unwrap();
        ctx.cancel.cancel();

        let err = build_series(&ctx, &sources, &mut sess, &mut series, &series_lineage()).unwrap_err();
        assert!(matches!(err, EtlError::Cancelled(_)), "{err:?}");
        assert!(!series.record.done);
        assert!(!store.row(series.record.uuid).unwrap().unwrap().0.done);
    }
}
