use serde::{Deserialize, Serialize};

use crate::utils::Timestamp;

/// A resolved answer as kept in the in-memory cache and in durable storage.
///
/// `value` is `None` for keys the remote side has no value for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The answer of the remote side.
    pub value: Option<String>,
    /// The time at which this entry stops being served.
    pub expires_at: Timestamp,
    /// The time at which this entry was created.
    pub cached_at: Timestamp,
}

impl CacheEntry {
    /// Whether this entry can no longer be served at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether this entry records the absence of a value.
    pub fn is_negative(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_layout() {
        let entry = CacheEntry {
            value: Some("France".into()),
            expires_at: 2_000,
            cached_at: 1_000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"value":"France","expiresAt":2000,"cachedAt":1000}"#
        );

        let negative: CacheEntry =
            serde_json::from_str(r#"{"value":null,"expiresAt":5,"cachedAt":1}"#).unwrap();
        assert!(negative.is_negative());
        assert!(!negative.is_expired(4));
        assert!(negative.is_expired(5));
    }
}
