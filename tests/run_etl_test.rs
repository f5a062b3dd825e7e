use crate::util::helpers::init_logging;
use crate::util::model::*;
use camino::{Utf8Path, Utf8PathBuf};
use idc_etl::{
    BlobRef, BlobStore, BucketName, EtlSettings, LocalBlobStore, NaturalKey, RetryPolicy,
    SourceSettings, published_instances, run_etl,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

mod util;

fn settings(dir: &Utf8Path, version: u32) -> EtlSettings {
    EtlSettings {
        version,
        previous_version: None,
        store_dir: dir.join("db"),
        tcia: Some(SourceSettings::Manifest {
            file: dir.join("manifest.json"),
        }),
        path: None,
        num_workers: 2,
        task_queue_bound: 4,
        batch_timeout: Duration::from_secs(60),
        retry: RetryPolicy::once(),
        log_dir: Some(dir.join("logs")),
        blob_root: Some(dir.join("blobs")),
        prestaging_bucket_prefix: "pre_".to_string(),
    }
}

/// Write a manifest of one collection whose instance files live in the "tcia" bucket.
fn write_source(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut m = manifest(vec![collection(
        "TCGA-LUAD",
        vec![patient("P1", &["aa", "bb"]), patient("P2", &["cc"])],
    )]);
    let mut files = Vec::new();
    for patient in m.collections[0].patients.iter_mut() {
        for instance in patient.studies[0].series[0].instances.iter_mut() {
            let blob = BlobRef::new("tcia", format!("{}.dcm", instance.sop_instance_uid));
            let path = dir.join("blobs").join("tcia").join(blob.name.as_str());
            fs_err::create_dir_all(path.parent().unwrap()).unwrap();
            fs_err::write(&path, instance.md5.as_bytes()).unwrap();
            files.push(path);
            instance.blob = Some(blob);
        }
    }
    fs_err::write(dir.join("manifest.json"), serde_json::to_vec(&m).unwrap()).unwrap();
    files
}

#[test]
fn test_run_etl_stages_blobs_and_logs_progress() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let dir = Utf8Path::from_path(tmp.path()).unwrap();
    write_source(dir);

    let root = run_etl(&settings(dir, 1)).unwrap();
    assert!(root.record.done);
    assert!(dir.join("db").join("idc_v1.json").is_file());

    let blobs = LocalBlobStore::new(dir.join("blobs"));
    let bucket = BucketName::from_static("pre_tcga_luad");
    let mut staged: Vec<_> = blobs
        .list(&bucket)
        .unwrap()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    staged.sort();
    let mut expected: Vec<_> = published_instances(&root)
        .into_iter()
        .map(|i| format!("{}.dcm", i.instance_uuid))
        .collect();
    expected.sort();
    assert_eq!(staged, expected);
    assert_eq!(expected.len(), 3);

    let success = fs_err::read_to_string(dir.join("logs").join("success.log")).unwrap();
    let lines: Vec<_> = success.lines().collect();
    assert!(lines.contains(&"collection\tTCGA-LUAD"), "{success}");
    assert!(lines.contains(&"patient\tTCGA-LUAD/P2"), "{success}");
    assert!(lines.contains(&"version\t1"), "{success}");
    assert_eq!(lines.iter().filter(|l| l.starts_with("instance\t")).count(), 3);
}

#[test]
fn test_run_etl_next_version_reuses_rows() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let dir = Utf8Path::from_path(tmp.path()).unwrap();
    write_source(dir);

    let first = run_etl(&settings(dir, 1)).unwrap();
    let second = run_etl(&settings(dir, 2)).unwrap();
    let collection = NaturalKey::from_static("TCGA-LUAD");
    assert_eq!(
        second.child(&collection).map(|c| c.record.uuid),
        first.child(&collection).map(|c| c.record.uuid)
    );
    assert!(dir.join("db").join("idc_v2.json").is_file());
}

#[test]
fn test_run_etl_without_sources_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Utf8Path::from_path(tmp.path()).unwrap();
    let mut settings = settings(dir, 1);
    settings.tcia = None;
    assert!(run_etl(&settings).is_err());
}

#[test]
fn test_dicom_folder_needs_blob_root() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Utf8Path::from_path(tmp.path()).unwrap();
    let mut settings = settings(dir, 1);
    settings.tcia = None;
    settings.blob_root = None;
    settings.path = Some(SourceSettings::DicomFolder {
        bucket: BucketName::from_static("htan"),
        collection: NaturalKey::from_static("HTAN-OHSU"),
    });
    let err = run_etl(&settings).unwrap_err();
    assert!(err.to_string().contains("IDC_ETL_BLOB_ROOT"), "{err}");
}
