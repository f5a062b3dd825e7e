use super::{BlobMetadata, CollectionDois, SourceProvider};
use crate::enums::{Level, SourceKind};
use crate::error::SourceError;
use crate::hashes::merkle_hash;
use crate::types::{BlobRef, Lineage, NaturalKey};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The full contents of a source, as a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub collections: Vec<ManifestCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestCollection {
    pub collection_id: NaturalKey,
    /// DOI of the collection's original data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default)]
    pub patients: Vec<ManifestPatient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPatient {
    pub submitter_case_id: NaturalKey,
    #[serde(default)]
    pub studies: Vec<ManifestStudy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStudy {
    pub study_instance_uid: NaturalKey,
    #[serde(default)]
    pub series: Vec<ManifestSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSeries {
    pub series_instance_uid: NaturalKey,
    /// DOI of the analysis result this series belongs to, if it is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_doi: Option<String>,
    #[serde(default)]
    pub instances: Vec<ManifestInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInstance {
    pub sop_instance_uid: NaturalKey,
    pub md5: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    #[serde(default)]
    pub excluded: bool,
}

/// Listings, hashes and instance metadata of a [Manifest], by lineage.
#[derive(Default)]
struct Index {
    children: HashMap<Lineage, Vec<NaturalKey>>,
    hashes: HashMap<Lineage, String>,
    instances: HashMap<Lineage, BlobMetadata>,
    dois: HashMap<NaturalKey, CollectionDois>,
}

impl Index {
    fn build(manifest: &Manifest) -> Self {
        let mut index = Self::default();
        let root = Lineage::root();
        let mut collections = Vec::with_capacity(manifest.collections.len());
        for collection in &manifest.collections {
            let collection_lineage = root.child(&collection.collection_id);
            let dois = index.dois.entry(collection.collection_id.clone()).or_default();
            dois.data_collection_doi = collection.doi.clone().unwrap_or_default();
            dois.analysis_collection_dois = collection
                .patients
                .iter()
                .flat_map(|p| &p.studies)
                .flat_map(|s| &s.series)
                .filter_map(|s| Some((s.series_instance_uid.clone(), s.source_doi.clone()?)))
                .collect();
            let mut patients = Vec::with_capacity(collection.patients.len());
            for patient in &collection.patients {
                let patient_lineage = collection_lineage.child(&patient.submitter_case_id);
                let mut studies = Vec::with_capacity(patient.studies.len());
                for study in &patient.studies {
                    let study_lineage = patient_lineage.child(&study.study_instance_uid);
                    let mut series = Vec::with_capacity(study.series.len());
                    for one_series in &study.series {
                        let series_lineage = study_lineage.child(&one_series.series_instance_uid);
                        let instances = one_series
                            .instances
                            .iter()
                            .map(|instance| index.instance(&series_lineage, instance))
                            .collect();
                        let hash = index.node(series_lineage, instances);
                        series.push((one_series.series_instance_uid.clone(), hash));
                    }
                    let hash = index.node(study_lineage, series);
                    studies.push((study.study_instance_uid.clone(), hash));
                }
                let hash = index.node(patient_lineage, studies);
                patients.push((patient.submitter_case_id.clone(), hash));
            }
            let hash = index.node(collection_lineage, patients);
            collections.push((collection.collection_id.clone(), hash));
        }
        index.node(root, collections);
        index
    }

    fn instance(&mut self, series: &Lineage, instance: &ManifestInstance) -> (NaturalKey, String) {
        let lineage = series.child(&instance.sop_instance_uid);
        self.hashes.insert(lineage.clone(), instance.md5.clone());
        self.instances.insert(
            lineage,
            BlobMetadata {
                md5: instance.md5.clone(),
                size: instance.size,
                blob: instance.blob.clone(),
                excluded: instance.excluded,
            },
        );
        (instance.sop_instance_uid.clone(), instance.md5.clone())
    }

    /// Record a node's listing and compute its hash from its children's.
    fn node(&mut self, lineage: Lineage, mut children: Vec<(NaturalKey, String)>) -> String {
        self.children
            .insert(lineage.clone(), children.iter().map(|(k, _)| k.clone()).collect());
        children.sort_by(|a, b| a.0.cmp(&b.0));
        let hash = merkle_hash(children.iter().map(|(_, h)| h.as_str()));
        self.hashes.insert(lineage, hash.clone());
        hash
    }
}

/// A [SourceProvider] backed by a [Manifest] held in memory.
pub struct ManifestSource {
    kind: SourceKind,
    index: Index,
}

impl ManifestSource {
    pub fn new(kind: SourceKind, manifest: &Manifest) -> Self {
        Self {
            kind,
            index: Index::build(manifest),
        }
    }

    pub fn from_file(kind: SourceKind, path: &Utf8Path) -> Result<Self, SourceError> {
        let manifest: Manifest = serde_json::from_str(&fs_err::read_to_string(path)?)?;
        tracing::info!(
            source = %kind,
            path = path.as_str(),
            collections = manifest.collections.len(),
            "loaded manifest"
        );
        Ok(Self::new(kind, &manifest))
    }
}

impl SourceProvider for ManifestSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn list_children(&self, parent: &Lineage) -> Result<Vec<NaturalKey>, SourceError> {
        Ok(self.index.children.get(parent).cloned().unwrap_or_default())
    }

    fn hash_of(&self, lineage: &Lineage) -> Result<String, SourceError> {
        Ok(self.index.hashes.get(lineage).cloned().unwrap_or_default())
    }

    fn instance_metadata(&self, lineage: &Lineage) -> Result<BlobMetadata, SourceError> {
        self.index
            .instances
            .get(lineage)
            .cloned()
            .ok_or_else(|| SourceError::Unknown {
                source_kind: self.kind,
                level: Level::Instance,
                lineage: lineage.clone(),
            })
    }

    fn collection_dois(&self, collection: &NaturalKey) -> Result<CollectionDois, SourceError> {
        Ok(self.index.dois.get(collection).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::md5_hex;

    const MANIFEST: &str = r#"{
        "collections": [{
            "collection_id": "C1",
            "doi": "10.7937/K9/TCIA.2016.JGNIHEP5",
            "patients": [{
                "submitter_case_id": "P1",
                "studies": [{
                    "study_instance_uid": "1.1",
                    "series": [{
                        "series_instance_uid": "1.1.1",
                        "source_doi": "10.5281/zenodo.7975081",
                        "instances": [
                            {"sop_instance_uid": "1.1.1.2", "md5": "bb", "size": 20, "excluded": true},
                            {"sop_instance_uid": "1.1.1.1", "md5": "aa", "size": 10,
                             "blob": {"bucket": "tcia", "name": "1.1.1.1.dcm"}}
                        ]
                    }]
                }]
            }]
        }]
    }"#;

    fn source() -> ManifestSource {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        ManifestSource::new(SourceKind::Tcia, &manifest)
    }

    fn lineage(keys: &[&str]) -> Lineage {
        keys.iter().copied().collect()
    }

    #[test]
    fn test_listing_keeps_manifest_order() {
        let source = source();
        let actual = source.list_children(&lineage(&["C1", "P1", "1.1", "1.1.1"])).unwrap();
        assert_eq!(
            actual,
            vec![NaturalKey::from_static("1.1.1.2"), NaturalKey::from_static("1.1.1.1")]
        );
        assert!(source.list_children(&lineage(&["C2"])).unwrap().is_empty());
    }

    #[test]
    fn test_hashes_bottom_up_sorted() {
        let source = source();
        let series = md5_hex(b"aabb");
        assert_eq!(source.hash_of(&lineage(&["C1", "P1", "1.1", "1.1.1"])).unwrap(), series);
        let study = md5_hex(series.as_bytes());
        assert_eq!(source.hash_of(&lineage(&["C1", "P1", "1.1"])).unwrap(), study);
        assert_eq!(source.hash_of(&lineage(&["C9"])).unwrap(), "");
    }

    #[test]
    fn test_instance_metadata() {
        let source = source();
        let actual = source
            .instance_metadata(&lineage(&["C1", "P1", "1.1", "1.1.1", "1.1.1.1"]))
            .unwrap();
        assert_eq!(actual.size, 10);
        assert_eq!(actual.blob, Some(BlobRef::new("tcia", "1.1.1.1.dcm")));
        let excluded = source
            .instance_metadata(&lineage(&["C1", "P1", "1.1", "1.1.1", "1.1.1.2"]))
            .unwrap();
        assert!(excluded.excluded);
        assert!(matches!(
            source.instance_metadata(&lineage(&["C1", "P1", "1.1", "1.1.1", "nope"])),
            Err(SourceError::Unknown { .. })
        ));
    }

    #[test]
    fn test_collection_dois() {
        let dois = source()
            .collection_dois(&NaturalKey::from_static("C1"))
            .unwrap();
        assert_eq!(dois.data_collection_doi, "10.7937/K9/TCIA.2016.JGNIHEP5");
        assert_eq!(
            dois.source_doi(&NaturalKey::from_static("1.1.1")),
            "10.5281/zenodo.7975081"
        );
        let unknown = source().collection_dois(&NaturalKey::from_static("C9")).unwrap();
        assert!(unknown.data_collection_doi.is_empty());
    }
}
