//! Compact builders for test manifests.
//!
//! A patient `P1` gets one study `P1.1` with one series `P1.1.1`, whose instances
//! are `P1.1.1.{i}`. Each instance's MD5 is given explicitly so that tests can change
//! one and watch the revision propagate.

use idc_etl::NaturalKey;
use idc_etl::source::{
    Manifest, ManifestCollection, ManifestInstance, ManifestPatient, ManifestSeries, ManifestStudy,
};

pub(crate) fn manifest(collections: Vec<ManifestCollection>) -> Manifest {
    Manifest { collections }
}

pub(crate) fn collection(id: &str, patients: Vec<ManifestPatient>) -> ManifestCollection {
    ManifestCollection {
        collection_id: NaturalKey::from(id),
        doi: None,
        patients,
    }
}

/// A patient with a single study and series holding instances with the given MD5s.
pub(crate) fn patient(id: &str, md5s: &[&str]) -> ManifestPatient {
    let study = format!("{id}.1");
    let series = format!("{study}.1");
    let instances = md5s
        .iter()
        .enumerate()
        .map(|(i, md5)| instance(&format!("{series}.{i}"), md5))
        .collect();
    ManifestPatient {
        submitter_case_id: NaturalKey::from(id),
        studies: vec![ManifestStudy {
            study_instance_uid: NaturalKey::from(study),
            series: vec![ManifestSeries {
                series_instance_uid: NaturalKey::from(series),
                source_doi: None,
                instances,
            }],
        }],
    }
}

pub(crate) fn instance(uid: &str, md5: &str) -> ManifestInstance {
    ManifestInstance {
        sop_instance_uid: NaturalKey::from(uid),
        md5: md5.to_string(),
        size: 1024,
        blob: None,
        excluded: false,
    }
}
