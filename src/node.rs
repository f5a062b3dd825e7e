use crate::enums::{Level, SourceKind, Sources};
use crate::hashes::Hashes;
use crate::types::{IdcVersion, NaturalKey};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Columns which only exist at one level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum Details {
    Version {
        previous_version: IdcVersion,
    },
    Collection {
        /// IDC assigned collection ID, stable across revisions.
        idc_collection_id: String,
    },
    Patient {
        /// IDC assigned patient ID, stable across revisions.
        idc_case_id: String,
    },
    Study {
        study_instances: u32,
    },
    Series {
        series_instances: u32,
        /// DOI of the collection or analysis result this series is cited under.
        #[serde(default)]
        source_doi: String,
    },
    Instance(InstanceDetails),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub source: SourceKind,
    /// Blob size in bytes.
    pub size: u64,
    /// Excluded instances are hashed but left out of published views.
    pub excluded: bool,
}

impl Details {
    /// Details of a node which was just created at `level`.
    ///
    /// `source` is only used at the instance level, where each instance comes
    /// from exactly one source.
    pub fn fresh(level: Level, source: SourceKind, previous_version: IdcVersion) -> Self {
        match level {
            Level::Version => Details::Version { previous_version },
            Level::Collection => Details::Collection {
                idc_collection_id: Uuid::new_v4().to_string(),
            },
            Level::Patient => Details::Patient {
                idc_case_id: Uuid::new_v4().to_string(),
            },
            Level::Study => Details::Study { study_instances: 0 },
            Level::Series => Details::Series {
                series_instances: 0,
                source_doi: String::new(),
            },
            Level::Instance => Details::instance(source),
        }
    }

    pub fn instance(source: SourceKind) -> Self {
        Details::Instance(InstanceDetails {
            source,
            size: 0,
            excluded: false,
        })
    }
}

/// A row of the ETL database: every scalar column of one version of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub level: Level,
    pub natural_key: NaturalKey,
    /// Identifies this version of the entity; regenerated on every revision.
    pub uuid: Uuid,
    /// Version in which the entity first appeared.
    pub init_idc_version: IdcVersion,
    /// Version of this row's content.
    pub rev_idc_version: IdcVersion,
    /// Last version in which this row was current, `0` while it still is.
    pub final_idc_version: IdcVersion,
    pub hashes: Option<Hashes>,
    pub sources: Sources,
    /// Per source, whether this row was revised relative to the previous version.
    pub revised: Sources,
    #[serde(with = "time::serde::rfc3339::option")]
    pub min_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub max_timestamp: Option<OffsetDateTime>,
    pub done: bool,
    pub is_new: bool,
    pub expanded: bool,
    pub details: Details,
}

impl NodeRecord {
    /// A brand new entity, first seen in `version`.
    pub fn new(level: Level, natural_key: NaturalKey, version: IdcVersion, details: Details) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            level,
            natural_key,
            uuid: Uuid::new_v4(),
            init_idc_version: version,
            rev_idc_version: version,
            final_idc_version: 0,
            hashes: None,
            sources: Sources::default(),
            revised: Sources::default(),
            min_timestamp: Some(now),
            max_timestamp: Some(now),
            done: false,
            is_new: true,
            expanded: false,
            details,
        }
    }

    /// A new revision of this entity for `version`.
    ///
    /// Content columns are copied. Identity and processing state are regenerated:
    /// `uuid`, `rev_idc_version`, `final_idc_version`, `done`, `is_new`, `expanded`,
    /// `revised`. Hashes and sources are cleared because they are recomputed when
    /// the revision is built.
    pub fn revision(&self, version: IdcVersion, revised: Sources) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            level: self.level,
            natural_key: self.natural_key.clone(),
            uuid: Uuid::new_v4(),
            init_idc_version: self.init_idc_version,
            rev_idc_version: version,
            final_idc_version: 0,
            hashes: None,
            sources: Sources::default(),
            revised,
            min_timestamp: Some(now),
            max_timestamp: Some(now),
            done: false,
            is_new: false,
            expanded: false,
            details: self.details.clone(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.final_idc_version == 0
    }

    /// Stamp this row as having been checked now.
    pub fn touch(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.min_timestamp = Some(now);
        self.max_timestamp = Some(now);
    }

    pub fn instance_details(&self) -> Option<&InstanceDetails> {
        match &self.details {
            Details::Instance(details) => Some(details),
            _ => None,
        }
    }

    pub fn instance_details_mut(&mut self) -> Option<&mut InstanceDetails> {
        match &mut self.details {
            Details::Instance(details) => Some(details),
            _ => None,
        }
    }
}

/// A node of the IDC tree: its row, and its current children ordered by natural key.
///
/// Parents own their children exclusively and traversal is always top-down, so
/// there are no back-references.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedNode {
    pub record: NodeRecord,
    pub children: Vec<VersionedNode>,
}

impl VersionedNode {
    pub fn new(record: NodeRecord) -> Self {
        Self {
            record,
            children: Vec::new(),
        }
    }

    /// A revision of this node which starts out with the same children.
    pub fn revision(&self, version: IdcVersion, revised: Sources) -> Self {
        Self {
            record: self.record.revision(version, revised),
            children: self.children.clone(),
        }
    }

    pub fn key(&self) -> &NaturalKey {
        &self.record.natural_key
    }

    pub fn child(&self, key: &NaturalKey) -> Option<&VersionedNode> {
        self.children
            .binary_search_by(|c| c.key().cmp(key))
            .ok()
            .map(|i| &self.children[i])
    }

    pub fn child_mut(&mut self, key: &NaturalKey) -> Option<&mut VersionedNode> {
        self.children
            .binary_search_by(|c| c.key().cmp(key))
            .ok()
            .map(|i| &mut self.children[i])
    }

    /// Insert a child, keeping children ordered by natural key.
    pub fn insert_child(&mut self, child: VersionedNode) {
        let index = self
            .children
            .partition_point(|c| c.key() < child.key());
        self.children.insert(index, child);
    }

    /// Remove and return the child with the given natural key.
    pub fn remove_child(&mut self, key: &NaturalKey) -> Option<VersionedNode> {
        self.children
            .binary_search_by(|c| c.key().cmp(key))
            .ok()
            .map(|i| self.children.remove(i))
    }

    pub fn all_children_done(&self) -> bool {
        self.children.iter().all(|c| c.record.done)
    }

    /// Mark this node and its whole subtree as superseded after `previous_version`.
    pub fn retire(&mut self, previous_version: IdcVersion) {
        for child in self.children.iter_mut() {
            child.retire(previous_version);
        }
        self.record.final_idc_version = previous_version;
    }

    /// Visit every node of this subtree, parents before children.
    pub fn walk<'a, F: FnMut(&'a VersionedNode)>(&'a self, f: &mut F) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }
}
