//! The ETL metadata store.
//!
//! Rows are flat [NodeRecord]s keyed by uuid. Parent/child relations live in a
//! junction table (parent uuid to ordered child uuids), so an unchanged child can be
//! shared by successive revisions of its parent. Nothing is ever deleted.

mod batch;
mod json_store;

pub use batch::BatchStore;
pub use json_store::JsonStore;

use crate::enums::Level;
use crate::error::StoreError;
use crate::node::{Details, NodeRecord, VersionedNode};
use crate::types::{IdcVersion, NaturalKey};
use std::sync::Arc;
use uuid::Uuid;

/// A staged mutation of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Insert or replace a row.
    Row(NodeRecord),
    /// Replace the set of children linked to `parent`.
    Links { parent: Uuid, children: Vec<Uuid> },
    /// Register the root row of an IDC version.
    Root { version: IdcVersion, uuid: Uuid },
}

/// Storage backend for the ETL database.
pub trait MetadataStore: Send + Sync {
    /// The uuid of the version row of `version`, if it exists.
    fn root(&self, version: IdcVersion) -> Result<Option<Uuid>, StoreError>;

    /// A row and the uuids of its linked children.
    fn row(&self, uuid: Uuid) -> Result<Option<(NodeRecord, Vec<Uuid>)>, StoreError>;

    /// Apply all writes, or none of them.
    fn apply(&self, writes: Vec<Write>) -> Result<(), StoreError>;
}

/// Load a node and all of its descendants.
pub fn load_subtree(store: &dyn MetadataStore, uuid: Uuid) -> Result<VersionedNode, StoreError> {
    let (record, child_uuids) = store.row(uuid)?.ok_or(StoreError::MissingRow(uuid))?;
    let mut children = child_uuids
        .into_iter()
        .map(|child| load_subtree(store, child))
        .collect::<Result<Vec<_>, _>>()?;
    children.sort_by(|a, b| a.key().cmp(b.key()));
    Ok(VersionedNode { record, children })
}

/// Load the whole tree of an IDC version.
pub fn load_version(store: &dyn MetadataStore, version: IdcVersion) -> Result<VersionedNode, StoreError> {
    let root = store
        .root(version)?
        .ok_or(StoreError::MissingVersion(version))?;
    load_subtree(store, root)
}

/// Create the root row of `version`, unless it already exists.
///
/// The new version starts out linked to the current collections of `previous`, so
/// its expansion diffs against them. Without a previous version, the root is new and
/// everything below it will be too.
pub fn create_version(
    store: &dyn MetadataStore,
    version: IdcVersion,
    previous: IdcVersion,
) -> Result<Uuid, StoreError> {
    if let Some(uuid) = store.root(version)? {
        return Ok(uuid);
    }
    let mut record = NodeRecord::new(
        Level::Version,
        NaturalKey::from(version.to_string()),
        version,
        Details::Version {
            previous_version: previous,
        },
    );
    let children = match store.root(previous)? {
        Some(previous_root) => {
            let (_, links) = store
                .row(previous_root)?
                .ok_or(StoreError::MissingRow(previous_root))?;
            record.is_new = false;
            links
        }
        None => Vec::new(),
    };
    let uuid = record.uuid;
    tracing::info!(version, previous, carried = children.len(), "creating version");
    store.apply(vec![
        Write::Row(record),
        Write::Links {
            parent: uuid,
            children,
        },
        Write::Root { version, uuid },
    ])?;
    Ok(uuid)
}

/// A unit of work against the store: writes are staged, then committed together.
pub struct Session {
    store: Arc<dyn MetadataStore>,
    staged: Vec<Write>,
}

impl Session {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            staged: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Stage a node's row and its links to its current children.
    pub fn save(&mut self, node: &VersionedNode) {
        self.staged.push(Write::Row(node.record.clone()));
        self.staged.push(Write::Links {
            parent: node.record.uuid,
            children: node.children.iter().map(|c| c.record.uuid).collect(),
        });
    }

    /// Stage a node's row and the rows of its children, with links.
    pub fn save_with_children(&mut self, node: &VersionedNode) {
        self.save(node);
        for child in &node.children {
            self.save(child);
        }
    }

    /// Stage a row without touching its links.
    pub fn save_row(&mut self, record: &NodeRecord) {
        self.staged.push(Write::Row(record.clone()));
    }

    /// Stage the rows of a whole subtree, e.g. after retiring it.
    pub fn save_subtree_rows(&mut self, node: &VersionedNode) {
        node.walk(&mut |n| self.staged.push(Write::Row(n.record.clone())));
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        let writes = std::mem::take(&mut self.staged);
        if writes.is_empty() {
            return Ok(());
        }
        self.store.apply(writes)
    }

    pub fn rollback(&mut self) {
        if !self.staged.is_empty() {
            tracing::debug!(discarded = self.staged.len(), "rollback");
        }
        self.staged.clear();
    }

    /// Load a committed subtree, ignoring anything staged in this session.
    pub fn load(&self, uuid: Uuid) -> Result<VersionedNode, StoreError> {
        load_subtree(self.store.as_ref(), uuid)
    }

    pub fn staged(&self) -> &[Write] {
        &self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SourceKind;

    fn node(level: Level, key: &str) -> VersionedNode {
        VersionedNode::new(NodeRecord::new(
            level,
            NaturalKey::from(key),
            1,
            Details::fresh(level, SourceKind::Tcia, 0),
        ))
    }

    #[test]
    fn test_commit_then_load_subtree() {
        let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::in_memory());
        let mut patient = node(Level::Patient, "P1");
        patient.insert_child(node(Level::Study, "1.2.2"));
        patient.insert_child(node(Level::Study, "1.2.1"));
        let mut session = Session::new(Arc::clone(&store));
        session.save_with_children(&patient);
        session.commit().unwrap();
        let loaded = session.load(patient.record.uuid).unwrap();
        assert_eq!(loaded, patient);
    }

    #[test]
    fn test_rollback_discards_staged() {
        let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::in_memory());
        let patient = node(Level::Patient, "P1");
        let mut session = Session::new(Arc::clone(&store));
        session.save(&patient);
        session.rollback();
        session.commit().unwrap();
        assert!(store.row(patient.record.uuid).unwrap().is_none());
    }

    #[test]
    fn test_create_version_carries_previous_collections() {
        let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::in_memory());
        let first = create_version(store.as_ref(), 1, 0).unwrap();
        let mut root = load_subtree(store.as_ref(), first).unwrap();
        assert!(root.record.is_new);
        root.insert_child(node(Level::Collection, "C1"));
        let mut session = Session::new(Arc::clone(&store));
        session.save_with_children(&root);
        session.commit().unwrap();

        let second = create_version(store.as_ref(), 2, 1).unwrap();
        assert_eq!(create_version(store.as_ref(), 2, 1).unwrap(), second);
        let root = load_version(store.as_ref(), 2).unwrap();
        assert!(!root.record.is_new);
        let keys: Vec<_> = root.children.iter().map(|c| c.key().as_str()).collect();
        assert_eq!(keys, vec!["C1"]);
    }
}
