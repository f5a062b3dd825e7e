//! Build a [Manifest] by scanning a directory of DICOM files.

#![allow(non_snake_case)]

use super::manifest::{
    Manifest, ManifestCollection, ManifestInstance, ManifestPatient, ManifestSeries, ManifestStudy,
};
use crate::error::SourceError;
use crate::hashes::md5_hex;
use crate::types::{BlobRef, BucketName, NaturalKey};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::DataDictionary;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, StandardDataDictionary, Tag};
use std::collections::BTreeMap;
use walkdir::WalkDir;

type SeriesMap = BTreeMap<NaturalKey, Vec<ManifestInstance>>;
type StudyMap = BTreeMap<NaturalKey, SeriesMap>;
type PatientMap = BTreeMap<NaturalKey, StudyMap>;

/// Scan `bucket_dir`, the directory of `bucket`, for DICOM files of one collection.
///
/// Files which cannot be parsed as DICOM are skipped with a warning. Files missing
/// one of the identifying UIDs are an error. Symbolic links are not followed.
pub fn manifest_from_dicom_folder(
    bucket_dir: &Utf8Path,
    bucket: &BucketName,
    collection_id: NaturalKey,
) -> Result<Manifest, SourceError> {
    let files = find_files(bucket_dir)?;
    let mut patients = PatientMap::new();
    for path in files {
        let dcm = match dicom::object::open_file(&path) {
            Ok(dcm) => dcm,
            Err(e) => {
                tracing::warn!(path = path.as_str(), error = e.to_string(), "skipping non-DICOM file");
                continue;
            }
        };
        let PatientID = ttr(&dcm, tags::PATIENT_ID, &path)?;
        let StudyInstanceUID = ttr(&dcm, tags::STUDY_INSTANCE_UID, &path)?;
        let SeriesInstanceUID = ttr(&dcm, tags::SERIES_INSTANCE_UID, &path)?;
        let SOPInstanceUID = ttr(&dcm, tags::SOP_INSTANCE_UID, &path)?;
        let data = fs_err::read(&path)?;
        let name = path
            .strip_prefix(bucket_dir)
            .map(|p| p.as_str())
            .unwrap_or(path.as_str());
        let instance = ManifestInstance {
            sop_instance_uid: NaturalKey::from(SOPInstanceUID),
            md5: md5_hex(&data),
            size: data.len() as u64,
            blob: Some(BlobRef::new(bucket.clone(), name)),
            excluded: false,
        };
        patients
            .entry(NaturalKey::from(PatientID))
            .or_default()
            .entry(NaturalKey::from(StudyInstanceUID))
            .or_default()
            .entry(NaturalKey::from(SeriesInstanceUID))
            .or_default()
            .push(instance);
    }
    tracing::info!(
        bucket = bucket.as_str(),
        collection = collection_id.as_str(),
        patients = patients.len(),
        "scanned DICOM folder"
    );
    Ok(Manifest {
        collections: vec![ManifestCollection {
            collection_id,
            doi: None,
            patients: patients.into_iter().map(patient).collect(),
        }],
    })
}

fn patient((submitter_case_id, studies): (NaturalKey, StudyMap)) -> ManifestPatient {
    ManifestPatient {
        submitter_case_id,
        studies: studies
            .into_iter()
            .map(|(study_instance_uid, series)| ManifestStudy {
                study_instance_uid,
                series: series
                    .into_iter()
                    .map(|(series_instance_uid, instances)| ManifestSeries {
                        series_instance_uid,
                        source_doi: None,
                        instances,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Regular files under `dir`, sorted by path.
fn find_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SourceError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => files.push(path),
            Err(path) => tracing::warn!(path = ?path, "skipping non UTF-8 path"),
        }
    }
    Ok(files)
}

/// Required string tag
fn ttr(dcm: &DefaultDicomObject, tag: Tag, path: &Utf8Path) -> Result<String, SourceError> {
    tt(dcm, tag)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| SourceError::MissingTag {
            path: path.to_string(),
            tag: name_of(tag).unwrap_or("unknown"),
        })
}

/// Try to get the trimmed string value of a DICOM object.
fn tt(dcm: &DefaultDicomObject, tag: Tag) -> Option<&str> {
    dcm.element(tag)
        .ok()
        .and_then(|e| {
            e.string()
                .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
                .ok()
        })
}

/// Get the standard name of a tag.
fn name_of(tag: Tag) -> Option<&'static str> {
    StandardDataDictionary.by_tag(tag).map(|e| e.alias)
}
