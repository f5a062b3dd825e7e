use super::{build_collection, complete};
use crate::context::ExecutionContext;
use crate::error::EtlError;
use crate::node::VersionedNode;
use crate::source::AllSources;
use crate::store::{MetadataStore, Session, create_version};
use crate::types::Lineage;
use crate::versioner::EntityVersioner;
use std::sync::Arc;
use std::time::Instant;

/// Build IDC version `ctx.version` from the sources, resuming wherever a previous
/// run left off. Returns the completed version tree.
///
/// Collections are built in natural-key order. The first collection that fails
/// stops the run; everything committed before it is kept, and the version is not
/// marked done.
pub fn build_version(
    ctx: &ExecutionContext,
    sources: &Arc<AllSources>,
    store: &Arc<dyn MetadataStore>,
) -> Result<VersionedNode, EtlError> {
    let start = Instant::now();
    let uuid = create_version(store.as_ref(), ctx.version, ctx.previous_version)?;
    let mut sess = Session::new(Arc::clone(store));
    let mut root = sess.load(uuid)?;
    if root.record.done {
        tracing::info!(version = ctx.version, "version already built");
        return Ok(root);
    }
    tracing::info!(
        run = %ctx.run,
        version = ctx.version,
        previous_version = ctx.previous_version,
        workers = ctx.num_workers,
        "building version"
    );
    if let Err(e) = build_root(ctx, sources, &mut sess, &mut root) {
        sess.rollback();
        tracing::error!(version = ctx.version, error = e.to_string(), "version build failed");
        return Err(e);
    }
    tracing::info!(
        target: "idc_etl::progress",
        version = ctx.version,
        collections = root.children.len(),
        elapsed = ?start.elapsed(),
        "version built"
    );
    Ok(root)
}

fn build_root(
    ctx: &ExecutionContext,
    sources: &Arc<AllSources>,
    sess: &mut Session,
    root: &mut VersionedNode,
) -> Result<(), EtlError> {
    let lineage = Lineage::root();
    if !root.record.expanded {
        EntityVersioner::new(ctx, sources).expand(sess, root, &lineage)?;
    }
    for collection in root.children.iter_mut().filter(|c| !c.record.done) {
        let collection_lineage = lineage.child(collection.key());
        build_collection(ctx, sources, sess, collection, &collection_lineage)?;
    }
    complete(ctx, sources, sess, root, &lineage)
}
