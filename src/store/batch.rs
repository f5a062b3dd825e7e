use super::{MetadataStore, Write};
use crate::distributor::CancelToken;
use crate::error::StoreError;
use crate::node::NodeRecord;
use crate::types::IdcVersion;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Pending {
    versions: BTreeMap<IdcVersion, Uuid>,
    rows: HashMap<Uuid, NodeRecord>,
    links: HashMap<Uuid, Vec<Uuid>>,
}

impl Pending {
    fn write(&mut self, write: Write) {
        match write {
            Write::Row(record) => {
                self.rows.insert(record.uuid, record);
            }
            Write::Links { parent, children } => {
                self.links.insert(parent, children);
            }
            Write::Root { version, uuid } => {
                self.versions.insert(version, uuid);
            }
        }
    }

    fn len(&self) -> usize {
        self.versions.len() + self.rows.len() + self.links.len()
    }

    fn to_writes(&self) -> Vec<Write> {
        let rows = self.rows.values().cloned().map(Write::Row);
        let links = self.links.iter().map(|(parent, children)| Write::Links {
            parent: *parent,
            children: children.clone(),
        });
        let versions = self
            .versions
            .iter()
            .map(|(version, uuid)| Write::Root {
                version: *version,
                uuid: *uuid,
            });
        rows.chain(links).chain(versions).collect()
    }
}

/// The writes of one batch of tasks, held in memory on top of another store.
///
/// Reads see the batch's own writes first. Nothing reaches the underlying store
/// until [BatchStore::publish], which applies the whole batch in one call. Once the
/// batch's [CancelToken] is cancelled, every further write fails, so a batch which
/// was abandoned can neither be published nor written to by workers which are
/// still running.
pub struct BatchStore {
    base: Arc<dyn MetadataStore>,
    pending: Mutex<Pending>,
    cancel: CancelToken,
}

impl BatchStore {
    pub fn new(base: Arc<dyn MetadataStore>, cancel: CancelToken) -> Self {
        Self {
            base,
            pending: Default::default(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Apply everything written to this batch to the underlying store, atomically.
    /// Returns the number of writes applied.
    pub fn publish(&self) -> Result<usize, StoreError> {
        let _guard = self.cancel.guard()?;
        let mut pending = self.pending.lock().map_err(|_| StoreError::Poisoned)?;
        let writes = pending.to_writes();
        let count = writes.len();
        if count > 0 {
            self.base.apply(writes)?;
        }
        *pending = Pending::default();
        Ok(count)
    }

    /// Cancel the batch and drop its writes. Returns how many were dropped.
    pub fn abandon(&self) -> usize {
        self.cancel.cancel();
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending).len(),
            Err(_) => 0,
        }
    }
}

impl MetadataStore for BatchStore {
    fn root(&self, version: IdcVersion) -> Result<Option<Uuid>, StoreError> {
        let pending = self.pending.lock().map_err(|_| StoreError::Poisoned)?;
        match pending.versions.get(&version) {
            Some(uuid) => Ok(Some(*uuid)),
            None => {
                drop(pending);
                self.base.root(version)
            }
        }
    }

    fn row(&self, uuid: Uuid) -> Result<Option<(NodeRecord, Vec<Uuid>)>, StoreError> {
        let pending = self.pending.lock().map_err(|_| StoreError::Poisoned)?;
        let record = pending.rows.get(&uuid).cloned();
        let links = pending.links.get(&uuid).cloned();
        drop(pending);
        if let (Some(record), Some(links)) = (&record, &links) {
            return Ok(Some((record.clone(), links.clone())));
        }
        let base = self.base.row(uuid)?;
        Ok(match (record, base) {
            (Some(record), base) => {
                let links = links.or(base.map(|(_, children)| children)).unwrap_or_default();
                Some((record, links))
            }
            (None, Some((record, children))) => Some((record, links.unwrap_or(children))),
            (None, None) => None,
        })
    }

    fn apply(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let _guard = self.cancel.guard()?;
        let mut pending = self.pending.lock().map_err(|_| StoreError::Poisoned)?;
        for write in writes {
            pending.write(write);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{Level, SourceKind};
    use crate::error::BatchCancelled;
    use crate::node::Details;
    use crate::store::JsonStore;
    use crate::types::NaturalKey;

    fn record(key: &str) -> NodeRecord {
        NodeRecord::new(
            Level::Patient,
            NaturalKey::from(key),
            1,
            Details::fresh(Level::Patient, SourceKind::Tcia, 0),
        )
    }

    #[test]
    fn test_reads_see_batch_writes_before_publish() {
        let base = Arc::new(JsonStore::in_memory());
        let parent = record("P1");
        base.apply(vec![Write::Row(parent.clone())]).unwrap();

        let batch = BatchStore::new(base.clone(), CancelToken::default());
        let mut done = parent.clone();
        done.done = true;
        let child = record("P1.1");
        batch
            .apply(vec![
                Write::Row(done),
                Write::Row(child.clone()),
                Write::Links {
                    parent: parent.uuid,
                    children: vec![child.uuid],
                },
            ])
            .unwrap();

        let (seen, links) = batch.row(parent.uuid).unwrap().unwrap();
        assert!(seen.done);
        assert_eq!(links, vec![child.uuid]);
        let (unchanged, links) = base.row(parent.uuid).unwrap().unwrap();
        assert!(!unchanged.done);
        assert!(links.is_empty());
        assert!(base.row(child.uuid).unwrap().is_none());

        assert_eq!(batch.publish().unwrap(), 3);
        assert!(base.row(parent.uuid).unwrap().unwrap().0.done);
        assert!(base.row(child.uuid).unwrap().is_some());
    }

    #[test]
    fn test_abandoned_batch_refuses_writes() {
        let base = Arc::new(JsonStore::in_memory());
        let batch = BatchStore::new(base.clone(), CancelToken::default());
        let first = record("P1");
        batch.apply(vec![Write::Row(first.clone())]).unwrap();

        assert_eq!(batch.abandon(), 1);
        let late = record("P2");
        assert!(matches!(
            batch.apply(vec![Write::Row(late.clone())]),
            Err(StoreError::Cancelled(BatchCancelled))
        ));
        assert!(matches!(batch.publish(), Err(StoreError::Cancelled(_))));
        assert!(base.row(first.uuid).unwrap().is_none());
        assert!(base.row(late.uuid).unwrap().is_none());
    }
}
