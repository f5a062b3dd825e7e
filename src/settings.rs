//! ETL settings, which are configurable using environment variables.
use crate::retry::RetryPolicy;
use crate::types::{BucketName, IdcVersion, NaturalKey};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct EtlSettings {
    pub version: IdcVersion,
    /// Defaults to `version - 1`.
    #[serde(default)]
    pub previous_version: Option<IdcVersion>,
    pub store_dir: Utf8PathBuf,
    #[serde(default)]
    pub tcia: Option<SourceSettings>,
    #[serde(default)]
    pub path: Option<SourceSettings>,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_task_queue_bound")]
    pub task_queue_bound: usize,
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub log_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub blob_root: Option<Utf8PathBuf>,
    #[serde(default = "default_prestaging_bucket_prefix")]
    pub prestaging_bucket_prefix: String,
}

impl EtlSettings {
    pub fn previous_version(&self) -> IdcVersion {
        self.previous_version
            .unwrap_or_else(|| self.version.saturating_sub(1))
    }
}

/// Where one source of truth gets its data from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// A JSON [crate::source::Manifest] file.
    Manifest { file: Utf8PathBuf },
    /// DICOM files under `{blob_root}/{bucket}`, all belonging to one collection.
    DicomFolder {
        bucket: BucketName,
        collection: NaturalKey,
    },
    /// The NBIA REST API.
    Nbia {
        url: String,
        #[serde(default)]
        token_url: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_client_id")]
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        #[serde(default = "default_http_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_task_queue_bound() -> usize {
    16
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_prestaging_bucket_prefix() -> String {
    "idc_prestaging_".to_string()
}

fn default_client_id() -> String {
    "nbiaRestAPIClient".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(180)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::{Format, Json};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings: EtlSettings = Figment::new()
            .merge(Json::string(r#"{"version": 6, "store_dir": "/tmp/etl"}"#))
            .extract()
            .unwrap();
        assert_eq!(settings.previous_version(), 5);
        assert_eq!(settings.num_workers, 0);
        assert_eq!(settings.task_queue_bound, 16);
        assert_eq!(settings.retry, RetryPolicy::default());
        assert!(settings.tcia.is_none());
        assert_eq!(settings.prestaging_bucket_prefix, "idc_prestaging_");
    }

    #[test]
    fn test_sources() {
        let settings: EtlSettings = Figment::new()
            .merge(Json::string(
                r#"{
                    "version": 6,
                    "previous_version": 3,
                    "store_dir": "/tmp/etl",
                    "batch_timeout": "10m",
                    "tcia": {"kind": "nbia", "url": "https://example.org/nbia-api/services/v2", "timeout": "30s"},
                    "path": {"kind": "dicom_folder", "bucket": "htan", "collection": "HTAN-OHSU"}
                }"#,
            ))
            .extract()
            .unwrap();
        assert_eq!(settings.previous_version(), 3);
        assert_eq!(settings.batch_timeout, Duration::from_secs(600));
        assert_eq!(
            settings.path,
            Some(SourceSettings::DicomFolder {
                bucket: BucketName::from_static("htan"),
                collection: NaturalKey::from_static("HTAN-OHSU"),
            })
        );
        let Some(SourceSettings::Nbia {
            client_id, timeout, ..
        }) = &settings.tcia
        else {
            panic!("expected nbia settings, got {:?}", settings.tcia)
        };
        assert_eq!(client_id, "nbiaRestAPIClient");
        assert_eq!(*timeout, Duration::from_secs(30));
    }
}
