use crate::enums::SourceKind;
use crate::node::{Details, VersionedNode};
use crate::types::{IdcVersion, NaturalKey};
use serde::Serialize;
use uuid::Uuid;

/// One row of the published instance view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedInstance {
    pub collection_id: NaturalKey,
    pub idc_collection_id: String,
    pub submitter_case_id: NaturalKey,
    pub idc_case_id: String,
    pub study_instance_uid: NaturalKey,
    pub study_uuid: Uuid,
    pub series_instance_uid: NaturalKey,
    pub series_uuid: Uuid,
    pub source_doi: String,
    pub sop_instance_uid: NaturalKey,
    pub instance_uuid: Uuid,
    pub source: SourceKind,
    pub instance_size: u64,
    pub rev_idc_version: IdcVersion,
}

/// Current instances of a version, with their ancestry. Excluded instances are left
/// out even though they count towards the hashes.
pub fn published_instances(version_root: &VersionedNode) -> Vec<PublishedInstance> {
    let mut rows = Vec::new();
    for collection in current(version_root) {
        let idc_collection_id = match &collection.record.details {
            Details::Collection { idc_collection_id } => idc_collection_id.clone(),
            _ => String::new(),
        };
        for patient in current(collection) {
            let idc_case_id = match &patient.record.details {
                Details::Patient { idc_case_id } => idc_case_id.clone(),
                _ => String::new(),
            };
            for study in current(patient) {
                for series in current(study) {
                    let source_doi = match &series.record.details {
                        Details::Series { source_doi, .. } => source_doi.clone(),
                        _ => String::new(),
                    };
                    for instance in current(series) {
                        let Some(details) = instance.record.instance_details() else {
                            continue;
                        };
                        if details.excluded {
                            continue;
                        }
                        rows.push(PublishedInstance {
                            collection_id: collection.key().clone(),
                            idc_collection_id: idc_collection_id.clone(),
                            submitter_case_id: patient.key().clone(),
                            idc_case_id: idc_case_id.clone(),
                            study_instance_uid: study.key().clone(),
                            study_uuid: study.record.uuid,
                            series_instance_uid: series.key().clone(),
                            series_uuid: series.record.uuid,
                            source_doi: source_doi.clone(),
                            sop_instance_uid: instance.key().clone(),
                            instance_uuid: instance.record.uuid,
                            source: details.source,
                            instance_size: details.size,
                            rev_idc_version: instance.record.rev_idc_version,
                        });
                    }
                }
            }
        }
    }
    rows
}

fn current(node: &VersionedNode) -> impl Iterator<Item = &VersionedNode> {
    node.children.iter().filter(|c| c.record.is_current())
}
