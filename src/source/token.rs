use crate::enums::SourceKind;
use crate::error::{SourceError, check};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// OAuth password-grant credentials and the access token obtained with them.
///
/// One instance is shared by every worker of the process. Its mutex is held while a
/// token is being refreshed, so only one refresh request is ever in flight.
pub struct TokenCache {
    source_kind: SourceKind,
    token_url: String,
    form: Vec<(&'static str, String)>,
    state: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    7200
}

impl TokenCache {
    pub fn new(
        source_kind: SourceKind,
        token_url: String,
        username: String,
        password: String,
        client_id: String,
        client_secret: Option<String>,
    ) -> Self {
        let mut form = vec![
            ("username", username),
            ("password", password),
            ("client_id", client_id),
            ("grant_type", "password".to_string()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret));
        }
        Self {
            source_kind,
            token_url,
            form,
            state: Mutex::new(None),
        }
    }

    /// A valid access token, refreshed first if it is missing or about to expire.
    pub fn bearer(&self, client: &reqwest::blocking::Client) -> Result<String, SourceError> {
        // the cached token is replaced wholesale, so a poisoned lock holds nothing torn
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(token) = state.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }
        tracing::info!(source = %self.source_kind, url = self.token_url, "refreshing access token");
        let res = client.post(&self.token_url).form(&self.form).send()?;
        let data: TokenResponse = check(self.source_kind, res)?.json()?;
        let token = AccessToken {
            value: data.access_token,
            expires_at: now + Duration::from_secs(data.expires_in),
        };
        let value = token.value.clone();
        *state = Some(token);
        Ok(value)
    }

    /// Forget the cached token, e.g. after the server rejected it.
    pub fn invalidate(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(Duration::from_secs(3600), true)]
    #[case(Duration::from_secs(31), true)]
    #[case(Duration::from_secs(10), false)]
    fn test_is_fresh(#[case] remaining: Duration, #[case] expected: bool) {
        let now = Instant::now();
        let token = AccessToken {
            value: "t".to_string(),
            expires_at: now + remaining,
        };
        assert_eq!(token.is_fresh(now), expected);
    }

    #[test]
    fn test_token_response_default_expiry() {
        let data: TokenResponse = serde_json::from_str(r#"{"access_token": "abc"}"#).unwrap();
        assert_eq!(data.access_token, "abc");
        assert_eq!(data.expires_in, 7200);
    }
}
