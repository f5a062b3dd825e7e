use aliri_braid::braid;
use std::fmt::{Display, Formatter};

/// An IDC version number. `0` is reserved for "still current" in `final_idc_version`.
pub type IdcVersion = u32;

/// The domain-stable identifier of an entity: collection ID, submitter case ID,
/// or a DICOM Study/Series/SOP Instance UID. Shared by every revision of the entity.
#[braid(serde)]
pub struct NaturalKey;

/// Name of a bucket in a [crate::BlobStore].
#[braid(serde)]
pub struct BucketName;

/// Name of a blob within a bucket.
#[braid(serde)]
pub struct BlobName;

/// Fully-qualified location of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlobRef {
    pub bucket: BucketName,
    pub name: BlobName,
}

impl BlobRef {
    pub fn new(bucket: impl Into<BucketName>, name: impl Into<BlobName>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }
}

impl Display for BlobRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Natural keys from the collection down to (and including) a node.
///
/// The version root has an empty lineage. Sources are addressed by lineage at
/// every level because patient IDs are only unique within their collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lineage(Vec<NaturalKey>);

impl Lineage {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// The lineage of a child of this node.
    pub fn child(&self, key: &NaturalKey) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.clone());
        Self(keys)
    }

    /// Natural key of the node itself, `None` for the version root.
    pub fn key(&self) -> Option<&NaturalKey> {
        self.0.last()
    }

    pub fn keys(&self) -> &[NaturalKey] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<NaturalKey>> FromIterator<K> for Lineage {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl Display for Lineage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<_> = self.0.iter().map(|k| k.as_str()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_child() {
        let collection = Lineage::root().child(&NaturalKey::from_static("TCGA-LUAD"));
        let patient = collection.child(&NaturalKey::from_static("TCGA-05-4244"));
        assert_eq!(patient.depth(), 2);
        assert_eq!(patient.key().map(|k| k.as_str()), Some("TCGA-05-4244"));
        assert_eq!(patient.to_string(), "TCGA-LUAD/TCGA-05-4244");
        assert_eq!(Lineage::root().key(), None);
    }
}
