//! Level builders: expand a node, build its undone children, then complete it.
//!
//! Every builder works on an owned subtree and a [Session]. On error the caller
//! rolls the session back and reloads from the store before trying again, so the
//! in-memory tree never outlives a failed attempt.

mod collection;
mod series;
mod version;

pub use collection::build_collection;
pub use series::{build_instance, build_series};
pub use version::build_version;

use crate::context::ExecutionContext;
use crate::enums::Level;
use crate::error::{EtlError, HashValidationError};
use crate::hashes::combine;
use crate::node::{Details, VersionedNode};
use crate::source::AllSources;
use crate::store::Session;
use crate::types::Lineage;
use crate::versioner::EntityVersioner;

pub fn build_patient(
    ctx: &ExecutionContext,
    sources: &AllSources,
    sess: &mut Session,
    patient: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    build_interior(ctx, sources, sess, patient, lineage)
}

pub fn build_study(
    ctx: &ExecutionContext,
    sources: &AllSources,
    sess: &mut Session,
    study: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    build_interior(ctx, sources, sess, study, lineage)
}

/// Expand, build undone children, complete. Used for patients and studies.
///
/// Stops before each child once the batch has been cancelled.
fn build_interior(
    ctx: &ExecutionContext,
    sources: &AllSources,
    sess: &mut Session,
    node: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    if node.record.done {
        return Ok(());
    }
    if !node.record.expanded {
        EntityVersioner::new(ctx, sources).expand(sess, node, lineage)?;
    }
    for child in node.children.iter_mut().filter(|c| !c.record.done) {
        ctx.cancel.check()?;
        let child_lineage = lineage.child(child.key());
        match child.record.level {
            Level::Study => build_study(ctx, sources, sess, child, &child_lineage)?,
            Level::Series => build_series(ctx, sources, sess, child, &child_lineage)?,
            level => {
                return Err(EtlError::Misplaced {
                    level,
                    lineage: child_lineage,
                });
            }
        }
    }
    complete(ctx, sources, sess, node, lineage)
}

/// Compute a node's hashes from its children, check them against the sources, and
/// mark it done.
///
/// The version root has no source-side hash, so it is not checked.
pub(crate) fn complete(
    ctx: &ExecutionContext,
    sources: &AllSources,
    sess: &mut Session,
    node: &mut VersionedNode,
    lineage: &Lineage,
) -> Result<(), EtlError> {
    let level = node.record.level;
    let (hashes, flags) = combine(node.children.iter().map(|c| &c.record));
    if level != Level::Version {
        let source_side = sources.src_hashes(lineage)?;
        if hashes.per_source != source_side {
            tracing::error!(
                worker = ctx.worker,
                version = ctx.version,
                %level,
                %lineage,
                idc = ?hashes.per_source,
                source = ?source_side,
                "hash match failed"
            );
            return Err(HashValidationError {
                level,
                lineage: lineage.clone(),
                idc: hashes.per_source,
                source_side,
            }
            .into());
        }
    }
    node.record.hashes = Some(hashes);
    node.record.sources = flags;
    if let Some(latest) = node.children.iter().filter_map(|c| c.record.max_timestamp).max() {
        node.record.max_timestamp = Some(latest);
    }
    match &mut node.record.details {
        Details::Study { study_instances } => {
            *study_instances = node
                .children
                .iter()
                .map(|c| match c.record.details {
                    Details::Series {
                        series_instances, ..
                    } => series_instances,
                    _ => 0,
                })
                .sum();
        }
        Details::Series {
            series_instances,
            source_doi,
        } => {
            *series_instances = node.children.len() as u32;
            *source_doi = ctx.collection_dois.source_doi(&node.record.natural_key).to_string();
        }
        _ => (),
    }
    node.record.done = true;
    node.record.expanded = true;
    if level == Level::Series {
        sess.save_with_children(node);
    } else {
        sess.save(node);
    }
    sess.commit()?;
    if matches!(level, Level::Version | Level::Collection | Level::Patient) {
        let key = match lineage.depth() {
            0 => ctx.version.to_string(),
            _ => lineage.to_string(),
        };
        // patients are recorded once their batch is published
        if level != Level::Patient {
            ctx.success_log.record(level, &key);
        }
        tracing::info!(
            target: "idc_etl::progress",
            worker = ctx.worker,
            version = ctx.version,
            %level,
            %lineage,
            "done"
        );
    } else {
        tracing::debug!(worker = ctx.worker, %level, %lineage, "done");
    }
    Ok(())
}
