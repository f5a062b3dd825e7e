use super::{build_patient, complete};
use crate::blob::empty_bucket;
use crate::context::ExecutionContext;
use crate::distributor::{CancelToken, WorkDistributor};
use crate::enums::Level;
use crate::error::EtlError;
use crate::node::VersionedNode;
use crate::retry::RetryPolicy;
use crate::sanitize::prestaging_bucket;
use crate::source::AllSources;
use crate::store::{BatchStore, MetadataStore, Session};
use crate::types::{BlobRef, Lineage, NaturalKey};
use crate::versioner::EntityVersioner;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Expand a collection, build its undone patients and complete it.
///
/// Patients are built one at a time by the calling thread when `ctx.num_workers` is
/// 0, otherwise by a [WorkDistributor]. Either way the patients form one batch: each
/// is built by a task with its own session, writing to a [BatchStore] which is only
/// published once every patient was built. If any patient fails, or the workers
/// time out, the whole batch is rolled back and the collection stays undone.
pub fn build_collection(
    ctx: &ExecutionContext,
    sources: &Arc<AllSources>,
    sess: &mut Session,
    collection: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    if collection.record.done {
        return Ok(());
    }
    let start = Instant::now();
    if !collection.record.expanded {
        if let Some(blob_store) = &ctx.blob_store {
            let bucket = prestaging_bucket(&ctx.prestaging_bucket_prefix, collection.key());
            let deleted = ctx
                .retry
                .run("empty_bucket", |_| empty_bucket(blob_store.as_ref(), &bucket))?;
            tracing::info!(bucket = bucket.as_str(), deleted, "emptied prestaging bucket");
        }
        EntityVersioner::new(ctx, sources).expand(sess, collection, lineage)?;
    }
    let ctx = &ctx
        .clone()
        .with_collection_dois(sources.collection_dois(collection.key())?);

    let pending: Vec<Uuid> = collection
        .children
        .iter()
        .filter(|c| !c.record.done)
        .map(|c| c.record.uuid)
        .collect();
    tracing::info!(
        worker = ctx.worker,
        collection = %lineage,
        patients = collection.children.len(),
        pending = pending.len(),
        doi = ctx.collection_dois.data_collection_doi.as_str(),
        "building patients"
    );
    let batch = Arc::new(BatchStore::new(Arc::clone(sess.store()), CancelToken::default()));
    let built = match build_patients(ctx, sources, &batch, pending, lineage) {
        Ok(built) => built,
        Err(e) => {
            let discarded = batch.abandon();
            discard_staged_blobs(ctx, sess.store().as_ref(), collection.key());
            tracing::error!(
                worker = ctx.worker,
                version = ctx.version,
                collection = %lineage,
                discarded,
                error = e.to_string(),
                "patient batch abandoned and rolled back"
            );
            return Err(e);
        }
    };
    let published = batch.publish()?;
    tracing::debug!(collection = %lineage, writes = published, "published patient batch");
    for patient in built {
        ctx.success_log
            .record(Level::Patient, &lineage.child(patient.key()).to_string());
        if let Some(slot) = collection.child_mut(patient.key()) {
            *slot = patient;
        }
    }

    complete(ctx, sources, sess, collection, lineage)?;
    tracing::info!(
        target: "idc_etl::progress",
        worker = ctx.worker,
        version = ctx.version,
        collection = %lineage,
        elapsed = ?start.elapsed(),
        "collection built"
    );
    Ok(())
}

/// Build the patients `pending` into `batch`, in the order given.
///
/// Patient tasks are retried whole, so the calls they make are tried once.
fn build_patients(
    ctx: &ExecutionContext,
    sources: &Arc<AllSources>,
    batch: &Arc<BatchStore>,
    pending: Vec<Uuid>,
    collection: &Lineage,
) -> Result<Vec<VersionedNode>, EtlError> {
    let cancel = batch.cancel_token().clone();
    let task_ctx = ctx
        .clone()
        .with_retry(RetryPolicy::once())
        .with_cancel(cancel.clone());
    let task_sources = Arc::new(sources.with_retry(RetryPolicy::once()));
    let store: Arc<dyn MetadataStore> = batch.clone();
    if ctx.num_workers == 0 {
        return pending
            .iter()
            .map(|uuid| {
                ctx.retry.run("build_patient", |_| {
                    patient_task(&task_ctx, &task_sources, &store, *uuid, collection)
                })
            })
            .collect();
    }
    let distributor = WorkDistributor::new(
        "patients",
        ctx.num_workers,
        ctx.task_queue_bound,
        ctx.batch_timeout,
        ctx.retry.clone(),
    )
    .with_cancel(cancel);
    let collection = collection.clone();
    Ok(distributor.distribute(pending, move |worker, uuid| {
        patient_task(
            &task_ctx.for_worker(worker),
            &task_sources,
            &store,
            *uuid,
            &collection,
        )
    })?)
}

/// Build one patient from its committed state, in its own session.
fn patient_task(
    ctx: &ExecutionContext,
    sources: &AllSources,
    store: &Arc<dyn MetadataStore>,
    uuid: Uuid,
    collection: &Lineage,
) -> Result<VersionedNode, EtlError> {
    ctx.cancel.check()?;
    let mut sess = Session::new(Arc::clone(store));
    let mut patient = sess.load(uuid)?;
    let lineage = collection.child(patient.key());
    match build_patient(ctx, sources, &mut sess, &mut patient, &lineage) {
        Ok(()) => Ok(patient),
        Err(e) => {
            sess.rollback();
            tracing::error!(
                worker = ctx.worker,
                version = ctx.version,
                patient = %lineage,
                error = e.to_string(),
                "patient build failed"
            );
            Err(e)
        }
    }
}

/// Delete the prestaged blobs of instances which have no committed row.
fn discard_staged_blobs(ctx: &ExecutionContext, store: &dyn MetadataStore, collection: &NaturalKey) {
    let Some(blob_store) = &ctx.blob_store else {
        return;
    };
    let bucket = prestaging_bucket(&ctx.prestaging_bucket_prefix, collection);
    let names = match blob_store.list(&bucket) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(bucket = bucket.as_str(), error = e.to_string(), "cannot list prestaging bucket");
            return;
        }
    };
    let mut deleted = 0;
    for name in names {
        let Some(uuid) = name
            .as_str()
            .strip_suffix(".dcm")
            .and_then(|uuid| Uuid::parse_str(uuid).ok())
        else {
            continue;
        };
        if !matches!(store.row(uuid), Ok(None)) {
            continue;
        }
        match blob_store.delete(&BlobRef::new(bucket.clone(), name)) {
            Ok(()) => deleted += 1,
            Err(e) => tracing::warn!(bucket = bucket.as_str(), error = e.to_string(), "cannot delete blob"),
        }
    }
    tracing::info!(bucket = bucket.as_str(), deleted, "deleted blobs of rolled back instances");
}
