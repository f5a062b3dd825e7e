use crate::types::{BucketName, NaturalKey};
use regex::Regex;
use std::sync::OnceLock;

/// Name of the prestaging bucket of a collection: `prefix` followed by the collection
/// ID, lowercased, with runs of anything but letters and digits replaced by "_".
pub(crate) fn prestaging_bucket(prefix: &str, collection_id: &NaturalKey) -> BucketName {
    let lowered = collection_id.as_str().replace('\0', "").to_lowercase();
    let sanitized = INVALID_CHARS_RE
        .get_or_init(|| Regex::new(r#"[^a-z0-9]+"#).unwrap())
        .replace_all(&lowered, "_");
    BucketName::from(format!("{prefix}{sanitized}"))
}

static INVALID_CHARS_RE: OnceLock<Regex> = OnceLock::new();
