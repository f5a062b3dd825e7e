use crate::blob::{BlobStore, LocalBlobStore};
use crate::builder::build_version;
use crate::config::get_config;
use crate::context::ExecutionContext;
use crate::enums::SourceKind;
use crate::node::VersionedNode;
use crate::run_log::SuccessLog;
use crate::settings::{EtlSettings, SourceSettings};
use crate::source::{
    AllSources, ManifestSource, NbiaSource, SourceProvider, TokenCache, manifest_from_dicom_folder,
};
use crate::store::{JsonStore, MetadataStore};
use crate::validation::validate_tree;
use anyhow::Context;
use camino::Utf8Path;
use std::sync::Arc;

/// Read [EtlSettings] from `IDC_ETL_*` environment variables.
pub fn settings_from_env() -> anyhow::Result<EtlSettings> {
    get_config()
        .extract()
        .context("Invalid IDC_ETL_* settings")
}

/// Build the IDC version described by `settings`, then check the result.
pub fn run_etl(settings: &EtlSettings) -> anyhow::Result<VersionedNode> {
    let version = settings.version;
    let previous = settings.previous_version();
    let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::open(&settings.store_dir, version, previous)?);

    let mut sources = AllSources::new(settings.retry.clone());
    for (kind, source) in [
        (SourceKind::Tcia, &settings.tcia),
        (SourceKind::Path, &settings.path),
    ] {
        if let Some(source) = source {
            sources = sources.with(provider(kind, source, settings.blob_root.as_deref())?);
        }
    }
    anyhow::ensure!(
        sources.provider(SourceKind::Tcia).is_some() || sources.provider(SourceKind::Path).is_some(),
        "No source configured, set IDC_ETL_TCIA__KIND and/or IDC_ETL_PATH__KIND"
    );

    let mut ctx = ExecutionContext::new(version, previous)
        .with_workers(settings.num_workers)
        .with_retry(settings.retry.clone());
    ctx.task_queue_bound = settings.task_queue_bound;
    ctx.batch_timeout = settings.batch_timeout;
    if let Some(log_dir) = &settings.log_dir {
        fs_err::create_dir_all(log_dir)?;
        ctx = ctx.with_success_log(Arc::new(SuccessLog::open(&log_dir.join("success.log"))?));
    }
    if let Some(blob_root) = &settings.blob_root {
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(blob_root));
        ctx = ctx.with_blob_store(blob_store, settings.prestaging_bucket_prefix.clone());
    }

    let root = build_version(&ctx, &Arc::new(sources), &store)?;
    let findings = validate_tree(&root);
    for finding in &findings {
        tracing::error!(version, "{finding}");
    }
    anyhow::ensure!(
        findings.is_empty(),
        "IDC version {version} failed validation with {} problem(s)",
        findings.len()
    );
    Ok(root)
}

fn provider(
    kind: SourceKind,
    settings: &SourceSettings,
    blob_root: Option<&Utf8Path>,
) -> anyhow::Result<Arc<dyn SourceProvider>> {
    let provider: Arc<dyn SourceProvider> = match settings {
        SourceSettings::Manifest { file } => Arc::new(ManifestSource::from_file(kind, file)?),
        SourceSettings::DicomFolder { bucket, collection } => {
            let blob_root = blob_root.with_context(|| {
                format!("{kind} source reads bucket {bucket} but IDC_ETL_BLOB_ROOT is not set")
            })?;
            let manifest =
                manifest_from_dicom_folder(&blob_root.join(bucket.as_str()), bucket, collection.clone())?;
            Arc::new(ManifestSource::new(kind, &manifest))
        }
        SourceSettings::Nbia {
            url,
            token_url,
            username,
            password,
            client_id,
            client_secret,
            timeout,
        } => {
            let token = match (token_url, username, password) {
                (Some(token_url), Some(username), Some(password)) => Some(TokenCache::new(
                    kind,
                    token_url.clone(),
                    username.clone(),
                    password.clone(),
                    client_id.clone(),
                    client_secret.clone(),
                )),
                (None, None, None) => None,
                _ => anyhow::bail!("{kind} source needs all of token_url, username and password, or none"),
            };
            Arc::new(NbiaSource::new(kind, url.clone(), *timeout, token)?)
        }
    };
    Ok(provider)
}
