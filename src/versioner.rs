//! Reconciliation of a parent's children against the sources, one level at a time.

use crate::context::ExecutionContext;
use crate::enums::{Level, SourceKind};
use crate::error::{DuplicateChildError, EtlError};
use crate::node::{Details, NodeRecord, VersionedNode};
use crate::source::{AllSources, SourceChild};
use crate::store::Session;
use crate::types::{Lineage, NaturalKey};
use std::collections::{BTreeMap, BTreeSet};

/// How a parent's children relate to what the sources list for it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Listed by the sources, not yet a child.
    pub new: Vec<SourceChild>,
    /// Listed by the sources and already a child.
    pub common: Vec<SourceChild>,
    /// A child which the sources no longer list.
    pub retired: Vec<NaturalKey>,
}

/// Split `listing` against the current children of a parent.
///
/// When the parent is new, every listed child is new and the current children are
/// not consulted.
pub fn partition(
    level: Level,
    parent: &Lineage,
    children: &[VersionedNode],
    listing: &[SourceChild],
    is_new: bool,
) -> Result<Partition, DuplicateChildError> {
    let mut counts: BTreeMap<&NaturalKey, usize> = BTreeMap::new();
    for child in listing {
        *counts.entry(&child.key).or_default() += 1;
    }
    let duplicates: Vec<_> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(k, _)| k.clone())
        .collect();
    if !duplicates.is_empty() {
        return Err(DuplicateChildError {
            level,
            parent: parent.clone(),
            duplicates,
        });
    }
    if is_new {
        return Ok(Partition {
            new: listing.to_vec(),
            ..Default::default()
        });
    }
    let existing: BTreeSet<&NaturalKey> = children.iter().map(|c| c.key()).collect();
    let listed: BTreeSet<&NaturalKey> = listing.iter().map(|c| &c.key).collect();
    let (common, new): (Vec<_>, Vec<_>) = listing
        .iter()
        .cloned()
        .partition(|c| existing.contains(&c.key));
    let retired = existing
        .difference(&listed)
        .map(|k| (*k).clone())
        .collect();
    Ok(Partition {
        new,
        common,
        retired,
    })
}

/// What one expansion did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpandSummary {
    pub new: usize,
    pub revised: usize,
    pub unchanged: usize,
    pub retired: usize,
}

/// Applies [partition] to a parent node: creates, revises, keeps and retires its
/// children for the current version.
pub struct EntityVersioner<'a> {
    ctx: &'a ExecutionContext,
    sources: &'a AllSources,
}

impl<'a> EntityVersioner<'a> {
    pub fn new(ctx: &'a ExecutionContext, sources: &'a AllSources) -> Self {
        Self { ctx, sources }
    }

    /// Reconcile the children of `parent` (at `lineage`) with the sources, mark it
    /// expanded and commit.
    ///
    /// Children whose row was already written for this version are left alone, so
    /// expanding again after a crash or on a resumed run creates no new rows.
    pub fn expand(
        &self,
        sess: &mut Session,
        parent: &mut VersionedNode,
        lineage: &Lineage,
    ) -> Result<ExpandSummary, EtlError> {
        let level = parent.record.level;
        let Some(child_level) = level.child() else {
            parent.record.expanded = true;
            return Ok(ExpandSummary::default());
        };
        let listing = self.sources.children(lineage)?;
        let partition = partition(
            child_level,
            lineage,
            &parent.children,
            &listing,
            parent.record.is_new,
        )?;
        let mut summary = ExpandSummary::default();

        for child in partition.new {
            let source = first_source(&child);
            let mut record = NodeRecord::new(
                child_level,
                child.key,
                self.ctx.version,
                Details::fresh(child_level, source, self.ctx.previous_version),
            );
            record.sources = child.sources;
            record.revised = child.sources;
            parent.insert_child(VersionedNode::new(record));
            summary.new += 1;
        }

        for child in partition.common {
            let Some(existing) = parent.child_mut(&child.key) else {
                continue;
            };
            if existing.record.rev_idc_version == self.ctx.version {
                continue;
            }
            let src_hashes = self.sources.src_hashes(&lineage.child(&child.key))?;
            let revised = match &existing.record.hashes {
                Some(hashes) => hashes.revised_against(&src_hashes),
                None => child.sources,
            };
            if !revised.any() {
                existing.record.touch();
                existing.record.done = true;
                existing.record.expanded = true;
                summary.unchanged += 1;
                continue;
            }
            let mut revision = existing.revision(self.ctx.version, revised);
            revision.record.sources = child.sources;
            if let Some(mut old) = parent.remove_child(&child.key) {
                old.record.final_idc_version = self.ctx.previous_version;
                sess.save_row(&old.record);
            }
            tracing::debug!(
                level = %child_level,
                lineage = %lineage.child(&child.key),
                ?revised,
                "revised"
            );
            parent.insert_child(revision);
            summary.revised += 1;
        }

        for key in partition.retired {
            if let Some(mut old) = parent.remove_child(&key) {
                old.retire(self.ctx.previous_version);
                sess.save_subtree_rows(&old);
                summary.retired += 1;
            }
        }

        parent.record.expanded = true;
        sess.save_with_children(parent);
        sess.commit()?;
        tracing::info!(
            worker = self.ctx.worker,
            version = self.ctx.version,
            level = %level,
            lineage = %lineage,
            new = summary.new,
            revised = summary.revised,
            unchanged = summary.unchanged,
            retired = summary.retired,
            "expanded"
        );
        Ok(summary)
    }
}

/// The source an instance is attributed to. Radiology wins if both list it.
fn first_source(child: &SourceChild) -> SourceKind {
    child.sources.kinds().next().unwrap_or(SourceKind::Tcia)
}
