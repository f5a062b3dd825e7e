use crate::error::BlobError;
use crate::types::{BlobName, BlobRef, BucketName};
use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

/// Copy/delete/list operations of a blob store.
pub trait BlobStore: Send + Sync {
    fn copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<(), BlobError>;
    fn delete(&self, blob: &BlobRef) -> Result<(), BlobError>;
    fn exists(&self, blob: &BlobRef) -> Result<bool, BlobError>;
    fn list(&self, bucket: &BucketName) -> Result<Vec<BlobName>, BlobError>;
}

/// Delete every blob in `bucket`, returning how many were deleted.
pub fn empty_bucket(store: &dyn BlobStore, bucket: &BucketName) -> Result<usize, BlobError> {
    let blobs = store.list(bucket)?;
    for name in &blobs {
        store.delete(&BlobRef::new(bucket.clone(), name.clone()))?;
    }
    Ok(blobs.len())
}

/// A [BlobStore] where every bucket is a directory under `root`.
pub struct LocalBlobStore {
    root: Utf8PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, blob: &BlobRef) -> Utf8PathBuf {
        self.root.join(blob.bucket.as_str()).join(blob.name.as_str())
    }

    fn bucket_dir(&self, bucket: &BucketName) -> Utf8PathBuf {
        self.root.join(bucket.as_str())
    }
}

impl BlobStore for LocalBlobStore {
    fn copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<(), BlobError> {
        let src_path = self.path_of(src);
        if !src_path.is_file() {
            return Err(BlobError::NotFound(src.clone()));
        }
        let dst_path = self.path_of(dst);
        if let Some(parent) = dst_path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::copy(&src_path, &dst_path)?;
        Ok(())
    }

    fn delete(&self, blob: &BlobRef) -> Result<(), BlobError> {
        let path = self.path_of(blob);
        if !path.is_file() {
            return Err(BlobError::NotFound(blob.clone()));
        }
        fs_err::remove_file(path)?;
        Ok(())
    }

    fn exists(&self, blob: &BlobRef) -> Result<bool, BlobError> {
        Ok(self.path_of(blob).is_file())
    }

    fn list(&self, bucket: &BucketName) -> Result<Vec<BlobName>, BlobError> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        list_files(&dir)
    }
}

/// Regular files under `bucket_dir` as blob names: paths relative to the bucket
/// directory, sorted. Symbolic links are not followed.
fn list_files(bucket_dir: &Utf8Path) -> Result<Vec<BlobName>, BlobError> {
    let mut names = Vec::new();
    for entry in WalkDir::new(bucket_dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            tracing::warn!(path = ?entry.path(), "skipping non UTF-8 path");
            continue;
        };
        if let Ok(relative) = path.strip_prefix(bucket_dir) {
            names.push(BlobName::from(relative.as_str()));
        }
    }
    Ok(names)
}
