//! Consistency checks over a loaded version tree.

use crate::enums::Level;
use crate::error::SourceError;
use crate::hashes::{Hashes, SourceHashes, combine};
use crate::node::VersionedNode;
use crate::source::AllSources;
use crate::types::{IdcVersion, Lineage, NaturalKey};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// A problem found at one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub lineage: Lineage,
    pub level: Level,
    pub problem: Problem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// Two active children share a natural key.
    DuplicateChild(NaturalKey),
    /// An active node carries a final version.
    NotCurrent(IdcVersion),
    /// A done node has a child which is not.
    UndoneChild(NaturalKey),
    /// A done node's hashes differ from the hashes of its children.
    HashMismatch {
        stored: Option<Hashes>,
        computed: Hashes,
    },
    /// A done node's hashes differ from the sources'.
    SourceMismatch {
        idc: SourceHashes,
        source_side: SourceHashes,
    },
}

impl Display for Finding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: ", self.level, self.lineage)?;
        match &self.problem {
            Problem::DuplicateChild(key) => write!(f, "duplicate child {key}"),
            Problem::NotCurrent(v) => write!(f, "active but final_idc_version={v}"),
            Problem::UndoneChild(key) => write!(f, "done but child {key} is not"),
            Problem::HashMismatch { stored, computed } => {
                write!(f, "stored hashes {stored:?} != children's {computed:?}")
            }
            Problem::SourceMismatch { idc, source_side } => {
                write!(f, "idc hashes {idc:?} != source hashes {source_side:?}")
            }
        }
    }
}

/// Structural checks of every node under `root`, the version root.
pub fn validate_tree(root: &VersionedNode) -> Vec<Finding> {
    let mut findings = Vec::new();
    validate_node(root, &Lineage::root(), &mut findings);
    findings
}

fn validate_node(node: &VersionedNode, lineage: &Lineage, findings: &mut Vec<Finding>) {
    let mut report = |problem| {
        findings.push(Finding {
            lineage: lineage.clone(),
            level: node.record.level,
            problem,
        })
    };
    let mut seen = BTreeSet::new();
    for child in &node.children {
        if !seen.insert(child.key()) {
            report(Problem::DuplicateChild(child.key().clone()));
        }
    }
    if !node.record.is_current() {
        report(Problem::NotCurrent(node.record.final_idc_version));
    }
    if node.record.done {
        if let Some(child) = node.children.iter().find(|c| !c.record.done) {
            report(Problem::UndoneChild(child.key().clone()));
        }
        if node.record.level != Level::Instance {
            let (computed, _) = combine(node.children.iter().map(|c| &c.record));
            if node.record.hashes.as_ref() != Some(&computed) {
                report(Problem::HashMismatch {
                    stored: node.record.hashes.clone(),
                    computed,
                });
            }
        }
    }
    for child in &node.children {
        validate_node(child, &lineage.child(child.key()), findings);
    }
}

/// Compare the hashes of every done node below the version root with the sources.
pub fn compare_with_sources(
    root: &VersionedNode,
    sources: &AllSources,
) -> Result<Vec<Finding>, SourceError> {
    let mut findings = Vec::new();
    for collection in &root.children {
        compare_node(collection, &Lineage::root().child(collection.key()), sources, &mut findings)?;
    }
    Ok(findings)
}

fn compare_node(
    node: &VersionedNode,
    lineage: &Lineage,
    sources: &AllSources,
    findings: &mut Vec<Finding>,
) -> Result<(), SourceError> {
    if !node.record.done {
        return Ok(());
    }
    let source_side = sources.src_hashes(lineage)?;
    let idc = node
        .record
        .hashes
        .as_ref()
        .map(|h| h.per_source.clone())
        .unwrap_or_default();
    if idc != source_side {
        findings.push(Finding {
            lineage: lineage.clone(),
            level: node.record.level,
            problem: Problem::SourceMismatch { idc, source_side },
        });
        // only descend into mismatching subtrees to find where they diverge
        for child in &node.children {
            compare_node(child, &lineage.child(child.key()), sources, findings)?;
        }
    }
    Ok(())
}
