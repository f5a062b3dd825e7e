use super::{BlobMetadata, SourceProvider, TokenCache};
use crate::enums::{Level, SourceKind};
use crate::error::{SourceError, check};
use crate::types::{Lineage, NaturalKey};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use std::time::Duration;

/// A [SourceProvider] for the TCIA/NBIA REST API.
///
/// NBIA does not report blob sizes or locations, so instance metadata only carries
/// the MD5.
pub struct NbiaSource {
    kind: SourceKind,
    url: String,
    client: Client,
    token: Option<TokenCache>,
}

impl NbiaSource {
    pub fn new(
        kind: SourceKind,
        url: impl Into<String>,
        timeout: Duration,
        token: Option<TokenCache>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::ClientBuilder::new()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            kind,
            url: url.into().trim_end_matches('/').to_string(),
            client,
            token,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.url, name)
    }

    /// Send a request, with a bearer token if configured. A rejected token is
    /// refreshed and the request sent once more.
    fn send<F>(&self, request: F) -> Result<String, SourceError>
    where
        F: Fn() -> RequestBuilder,
    {
        let Some(token) = &self.token else {
            return self.text(request().send()?);
        };
        let res = request().bearer_auth(token.bearer(&self.client)?).send()?;
        if res.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(source = %self.kind, url = res.url().as_str(), "access token rejected");
            token.invalidate();
            let res = request().bearer_auth(token.bearer(&self.client)?).send()?;
            return self.text(res);
        }
        self.text(res)
    }

    fn text(&self, res: reqwest::blocking::Response) -> Result<String, SourceError> {
        // NBIA answers queries with no results with a 500 and this body
        if res.status() == StatusCode::INTERNAL_SERVER_ERROR {
            let url = res.url().to_string();
            let text = res.text()?;
            if text.trim() == "No data found." {
                return Ok(String::new());
            }
            return Err(SourceError::Status {
                source_kind: self.kind,
                url,
                status: StatusCode::INTERNAL_SERVER_ERROR,
                reason: "Internal Server Error",
                text: Some(text),
            });
        }
        Ok(check(self.kind, res)?.text()?)
    }

    fn get(&self, name: &str, query: &[(&str, &str)]) -> Result<String, SourceError> {
        let url = self.endpoint(name);
        self.send(|| self.client.get(&url).query(query))
    }

    fn post_form(&self, name: &str, form: &[(&str, &str)]) -> Result<String, SourceError> {
        let url = self.endpoint(name);
        self.send(|| self.client.post(&url).form(form))
    }
}

impl SourceProvider for NbiaSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn list_children(&self, parent: &Lineage) -> Result<Vec<NaturalKey>, SourceError> {
        let keys: Vec<&str> = parent.keys().iter().map(|k| k.as_str()).collect();
        let (body, field) = match *keys.as_slice() {
            [] => (self.get("getCollectionValues", &[])?, "Collection"),
            [c] => (self.get("getPatient", &[("Collection", c)])?, "PatientId"),
            [c, p] => (
                self.get("getPatientStudy", &[("Collection", c), ("PatientID", p)])?,
                "StudyInstanceUID",
            ),
            [c, p, s] => (
                self.get(
                    "getSeries",
                    &[("Collection", c), ("PatientID", p), ("StudyInstanceUID", s)],
                )?,
                "SeriesInstanceUID",
            ),
            [_, _, _, series] => (
                self.get("getSOPInstanceUIDs", &[("SeriesInstanceUID", series)])?,
                "SOPInstanceUID",
            ),
            _ => return Ok(Vec::new()),
        };
        parse_listing(&body, field)
    }

    fn hash_of(&self, lineage: &Lineage) -> Result<String, SourceError> {
        let keys: Vec<&str> = lineage.keys().iter().map(|k| k.as_str()).collect();
        let body = match *keys.as_slice() {
            [] => return Ok(String::new()),
            [c] => self.post_form("getMD5Hierarchy", &[("Collection", c)])?,
            [c, p] => self.post_form("getMD5Hierarchy", &[("Collection", c), ("PatientID", p)])?,
            [_, _, s] => self.post_form("getMD5Hierarchy", &[("StudyInstanceUID", s)])?,
            [_, _, _, s] => self.post_form("getMD5Hierarchy", &[("SeriesInstanceUID", s)])?,
            [.., i] => self.get("getM5HashForImage", &[("SOPInstanceUID", i)])?,
        };
        Ok(body.trim().to_string())
    }

    fn instance_metadata(&self, lineage: &Lineage) -> Result<BlobMetadata, SourceError> {
        if Level::at_depth(lineage.depth()) != Some(Level::Instance) {
            return Err(SourceError::Unknown {
                source_kind: self.kind,
                level: Level::Instance,
                lineage: lineage.clone(),
            });
        }
        let md5 = self.hash_of(lineage)?;
        if md5.is_empty() {
            return Err(SourceError::Unknown {
                source_kind: self.kind,
                level: Level::Instance,
                lineage: lineage.clone(),
            });
        }
        Ok(BlobMetadata {
            md5,
            size: 0,
            blob: None,
            excluded: false,
        })
    }
}

/// Extract `field` from every object of a JSON array. An empty body means no results.
fn parse_listing(body: &str, field: &str) -> Result<Vec<NaturalKey>, SourceError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(body)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.get(field).and_then(|v| v.as_str()).map(NaturalKey::from))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(r#"[{"PatientId": "P1", "Collection": "C1"}, {"PatientId": "P2"}]"#, "PatientId", vec!["P1", "P2"])]
    #[case(r#"[{"SOPInstanceUID": "1.2.3"}, {"SOPInstanceUID": "1.2.3"}]"#, "SOPInstanceUID", vec!["1.2.3", "1.2.3"])]
    #[case("", "Collection", vec![])]
    #[case("[]", "Collection", vec![])]
    fn test_parse_listing(#[case] body: &str, #[case] field: &str, #[case] expected: Vec<&str>) {
        let actual = parse_listing(body, field).unwrap();
        let actual: Vec<_> = actual.iter().map(|k| k.as_str()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_parse_listing_bad_json() {
        assert!(matches!(
            parse_listing("<html>", "Collection"),
            Err(SourceError::Manifest(_))
        ));
    }

    #[test]
    fn test_version_root_has_no_hash() {
        let source = NbiaSource::new(
            SourceKind::Tcia,
            "http://localhost:1/nbia-api/services/v1/",
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert_eq!(source.url, "http://localhost:1/nbia-api/services/v1");
        assert_eq!(source.hash_of(&Lineage::root()).unwrap(), "");
    }
}
