//! Hierarchical (Merkle-style) hashing of the IDC tree.
//!
//! A node's hash for a source is the MD5 of the concatenated hex digests of its
//! children's hashes for that source, children ordered by natural key. This is the
//! same function NBIA uses for `getMD5Hierarchy`, which is what lets us cross-check
//! a completed subtree against the source's own view of it.

use crate::enums::{PerSource, SourceKind, Sources};
use crate::node::NodeRecord;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// One hash per source.
pub type SourceHashes = PerSource<String>;

/// Per-source hashes of a node, plus the hash over all sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hashes {
    pub per_source: SourceHashes,
    pub all_sources: String,
}

impl Hashes {
    /// Hashes of a leaf whose content has the given MD5 and comes from `kind`.
    pub fn leaf(kind: SourceKind, md5: impl Into<String>) -> Self {
        let md5 = md5.into();
        let mut per_source = SourceHashes::default();
        *per_source.get_mut(kind) = md5.clone();
        Self {
            per_source,
            all_sources: md5,
        }
    }

    /// Which sources differ between `self` and `other`. The `all_sources` slot is
    /// derived, so it is not compared.
    pub fn revised_against(&self, other: &SourceHashes) -> Sources {
        self.per_source.zip_with(other, |a, b| a != b)
    }
}

/// MD5 over the concatenation of `hashes`, in the order given.
///
/// Empty strings are skipped. If nothing remains, the result is the empty string
/// rather than the MD5 of nothing.
pub fn merkle_hash<'a, I>(hashes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Md5::new();
    let mut empty = true;
    for hash in hashes.into_iter().filter(|h| !h.is_empty()) {
        hasher.update(hash.as_bytes());
        empty = false;
    }
    if empty {
        String::new()
    } else {
        hex::encode(hasher.finalize())
    }
}

/// MD5 of raw bytes as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Compute a parent's hashes and source flags from its children.
///
/// Children are sorted by natural key first. For each source only the children
/// flagged with that source contribute; `all_sources` covers every child.
pub fn combine<'a, I>(children: I) -> (Hashes, Sources)
where
    I: IntoIterator<Item = &'a NodeRecord>,
{
    let mut children: Vec<_> = children.into_iter().collect();
    children.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
    let per_source = SourceHashes::from_fn(|kind| {
        merkle_hash(
            children
                .iter()
                .filter(|c| *c.sources.get(kind))
                .filter_map(|c| c.hashes.as_ref())
                .map(|h| h.per_source.get(kind).as_str()),
        )
    });
    let all_sources = merkle_hash(
        children
            .iter()
            .filter_map(|c| c.hashes.as_ref())
            .map(|h| h.all_sources.as_str()),
    );
    let sources = children
        .iter()
        .fold(Sources::default(), |acc, c| acc.or(&c.sources));
    (
        Hashes {
            per_source,
            all_sources,
        },
        sources,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Level;
    use crate::node::{Details, NodeRecord};
    use crate::types::NaturalKey;

    fn leaf(key: &str, kind: SourceKind, md5: &str) -> NodeRecord {
        let mut record = NodeRecord::new(
            Level::Instance,
            NaturalKey::from(key),
            7,
            Details::instance(kind),
        );
        record.hashes = Some(Hashes::leaf(kind, md5));
        record.sources = Sources::only(kind);
        record
    }

    #[test]
    fn test_merkle_hash_of_nothing_is_empty() {
        assert_eq!(merkle_hash([]), "");
        assert_eq!(merkle_hash(["", ""]), "");
    }

    #[test]
    fn test_merkle_hash_is_md5_of_concatenation() {
        assert_eq!(merkle_hash(["ab", "cd"]), md5_hex(b"abcd"));
        assert_ne!(merkle_hash(["ab", "cd"]), merkle_hash(["cd", "ab"]));
    }

    #[test]
    fn test_combine_sorts_by_natural_key() {
        let a = leaf("1.2.1", SourceKind::Tcia, "aaaa");
        let b = leaf("1.2.2", SourceKind::Tcia, "bbbb");
        let (forward, _) = combine([&a, &b]);
        let (backward, _) = combine([&b, &a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.per_source.tcia, md5_hex(b"aaaabbbb"));
        assert_eq!(forward.all_sources, md5_hex(b"aaaabbbb"));
        assert_eq!(forward.per_source.path, "");
    }

    #[test]
    fn test_combine_per_source() {
        let a = leaf("1.2.1", SourceKind::Tcia, "aaaa");
        let b = leaf("1.2.2", SourceKind::Path, "bbbb");
        let (hashes, sources) = combine([&a, &b]);
        assert_eq!(hashes.per_source.tcia, md5_hex(b"aaaa"));
        assert_eq!(hashes.per_source.path, md5_hex(b"bbbb"));
        assert_eq!(hashes.all_sources, md5_hex(b"aaaabbbb"));
        assert!(sources.tcia && sources.path);
    }

    #[test]
    fn test_revised_against_ignores_all_sources() {
        let stored = Hashes {
            per_source: SourceHashes {
                tcia: "x".to_string(),
                path: "".to_string(),
            },
            all_sources: "whatever".to_string(),
        };
        let fresh = SourceHashes {
            tcia: "x".to_string(),
            path: "".to_string(),
        };
        assert!(!stored.revised_against(&fresh).any());
        let fresh = SourceHashes {
            tcia: "y".to_string(),
            path: "".to_string(),
        };
        assert_eq!(stored.revised_against(&fresh), Sources::only(SourceKind::Tcia));
    }
}
