//! Support to look keys up from HTTP endpoints.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::config::RemoteConfig;

use super::{LookupResponse, RemoteError, RemoteLookup, USER_AGENT};

/// The header carrying the end of the rate limit window, in seconds since the Unix epoch.
const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    value: Option<String>,
}

/// Lookup implementation that asks an HTTP endpoint.
///
/// The key is appended as the last path segment of the base URL. The endpoint is expected to
/// answer with:
///
/// - `200` and a JSON body `{"value": "..."}` (`null` for no value),
/// - `404` if it does not know the key,
/// - `429` when throttling, optionally with an `x-rate-limit-reset` or `retry-after` header.
#[derive(Debug, Clone)]
pub struct HttpLookup {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
}

impl HttpLookup {
    /// Creates a lookup with a client configured from `config`.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| RemoteError::InvalidLocation("no base URL configured".into()))?;

        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes());
            let value = HeaderValue::from_str(value);
            match (name, value) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %key, "Ignoring invalid lookup header"),
            }
        }

        Ok(Self::new(client, base_url, headers))
    }

    pub fn new(client: Client, base_url: Url, headers: HeaderMap) -> Self {
        Self {
            client,
            base_url,
            headers,
        }
    }

    fn lookup_url(&self, key: &str) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidLocation(self.base_url.to_string()))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }
}

/// Reads the end of the rate limit window from the response headers.
fn parse_reset_at(headers: &HeaderMap) -> Option<SystemTime> {
    let header_secs = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
    };

    if let Some(epoch_secs) = header_secs(RATE_LIMIT_RESET) {
        return SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(epoch_secs));
    }
    header_secs(header::RETRY_AFTER.as_str())
        .and_then(|delay_secs| SystemTime::now().checked_add(Duration::from_secs(delay_secs)))
}

#[async_trait]
impl RemoteLookup for HttpLookup {
    async fn request(&self, key: &str) -> Result<LookupResponse, RemoteError> {
        let url = self.lookup_url(key)?;
        tracing::debug!("Looking up `{}` at `{}`", key, url);

        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: LookupBody = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::Malformed(e.to_string()))?;
                Ok(LookupResponse {
                    value: body.value,
                    ..Default::default()
                })
            }
            StatusCode::NOT_FOUND => Ok(LookupResponse::missing()),
            StatusCode::TOO_MANY_REQUESTS => {
                let reset_at = parse_reset_at(response.headers());
                Ok(LookupResponse::throttled(reset_at))
            }
            status => Err(RemoteError::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(base: &str) -> HttpLookup {
        HttpLookup::new(Client::new(), base.parse().unwrap(), HeaderMap::new())
    }

    #[test]
    fn test_lookup_url() {
        let url = lookup("http://localhost/lookup/").lookup_url("alice").unwrap();
        assert_eq!(url.as_str(), "http://localhost/lookup/alice");

        let url = lookup("http://localhost/lookup").lookup_url("a b/c").unwrap();
        assert_eq!(url.as_str(), "http://localhost/lookup/a%20b%2Fc");
    }

    #[test]
    fn test_parse_reset_at() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_reset_at(&headers), None);

        headers.insert(RATE_LIMIT_RESET, HeaderValue::from_static("1700000000"));
        assert_eq!(
            parse_reset_at(&headers),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        let reset_at = parse_reset_at(&headers).unwrap();
        assert!(reset_at > SystemTime::now() + Duration::from_secs(50));
    }

    #[test]
    fn test_missing_base_url() {
        let result = HttpLookup::from_config(&RemoteConfig::default());
        assert!(matches!(result, Err(RemoteError::InvalidLocation(_))));
    }
}
