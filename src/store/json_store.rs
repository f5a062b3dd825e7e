use super::{MetadataStore, Write};
use crate::error::StoreError;
use crate::node::NodeRecord;
use crate::types::IdcVersion;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    versions: BTreeMap<IdcVersion, Uuid>,
    rows: HashMap<Uuid, NodeRecord>,
    links: HashMap<Uuid, Vec<Uuid>>,
}

/// Previous values of everything touched by one [MetadataStore::apply], so that a
/// failed flush can be undone.
#[derive(Default)]
struct Undo {
    versions: Vec<(IdcVersion, Option<Uuid>)>,
    rows: Vec<(Uuid, Option<NodeRecord>)>,
    links: Vec<(Uuid, Option<Vec<Uuid>>)>,
}

impl Tables {
    fn write(&mut self, write: Write, undo: &mut Undo) {
        match write {
            Write::Row(record) => {
                let uuid = record.uuid;
                undo.rows.push((uuid, self.rows.insert(uuid, record)));
            }
            Write::Links { parent, children } => {
                undo.links.push((parent, self.links.insert(parent, children)));
            }
            Write::Root { version, uuid } => {
                undo.versions.push((version, self.versions.insert(version, uuid)));
            }
        }
    }

    fn undo(&mut self, undo: Undo) {
        for (uuid, previous) in undo.rows.into_iter().rev() {
            restore(&mut self.rows, uuid, previous);
        }
        for (uuid, previous) in undo.links.into_iter().rev() {
            restore(&mut self.links, uuid, previous);
        }
        for (version, previous) in undo.versions.into_iter().rev() {
            match previous {
                Some(uuid) => self.versions.insert(version, uuid),
                None => self.versions.remove(&version),
            };
        }
    }
}

fn restore<V>(map: &mut HashMap<Uuid, V>, key: Uuid, previous: Option<V>) {
    match previous {
        Some(value) => map.insert(key, value),
        None => map.remove(&key),
    };
}

/// ETL database kept in memory and, optionally, persisted as one JSON file per
/// IDC version (`idc_v{N}.json`) after every commit.
pub struct JsonStore {
    tables: Mutex<Tables>,
    file: Option<Utf8PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            tables: Default::default(),
            file: None,
        }
    }

    /// Open the database of `version` under `dir`.
    ///
    /// If it does not exist yet, it starts as a copy of the database of `previous`,
    /// or empty if that does not exist either.
    pub fn open(dir: &Utf8Path, version: IdcVersion, previous: IdcVersion) -> Result<Self, StoreError> {
        fs_err::create_dir_all(dir)?;
        let file = Self::file_of(dir, version);
        let source = [file.clone(), Self::file_of(dir, previous)]
            .into_iter()
            .find(|f| f.is_file());
        let tables = match source {
            Some(source) => {
                tracing::info!(file = source.as_str(), "loading ETL database");
                serde_json::from_str(&fs_err::read_to_string(&source)?)?
            }
            None => {
                tracing::info!(file = file.as_str(), "creating empty ETL database");
                Tables::default()
            }
        };
        Ok(Self {
            tables: Mutex::new(tables),
            file: Some(file),
        })
    }

    pub fn file_of(dir: &Utf8Path, version: IdcVersion) -> Utf8PathBuf {
        dir.join(format!("idc_v{version}.json"))
    }

    fn flush(&self, tables: &Tables) -> Result<(), StoreError> {
        if let Some(file) = &self.file {
            let tmp = file.with_extension("json.tmp");
            fs_err::write(&tmp, serde_json::to_vec(tables)?)?;
            fs_err::rename(&tmp, file)?;
        }
        Ok(())
    }

    /// Number of rows, current or not.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.rows.len())
    }

    /// Every row ever written for the given natural key, at any level.
    pub fn history_of(&self, natural_key: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let mut rows: Vec<_> = tables
            .rows
            .values()
            .filter(|r| r.natural_key.as_str() == natural_key)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.rev_idc_version, r.final_idc_version == 0));
        Ok(rows)
    }
}

impl MetadataStore for JsonStore {
    fn root(&self, version: IdcVersion) -> Result<Option<Uuid>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.versions.get(&version).copied())
    }

    fn row(&self, uuid: Uuid) -> Result<Option<(NodeRecord, Vec<Uuid>)>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.rows.get(&uuid).map(|record| {
            let children = tables.links.get(&uuid).cloned().unwrap_or_default();
            (record.clone(), children)
        }))
    }

    fn apply(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let mut undo = Undo::default();
        for write in writes {
            tables.write(write, &mut undo);
        }
        if let Err(e) = self.flush(&tables) {
            tables.undo(undo);
            return Err(e);
        }
        Ok(())
    }
}
