//! API key model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// API key record. Only the sha-256 digest of the bearer token is stored;
/// the plaintext is returned once at issuance and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub key_id: Uuid,
    pub org_id: Uuid,
    pub label: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// Endpoint prefixes this key may call; empty means unrestricted.
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub expires_utc: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl ApiKey {
    pub fn allows(&self, endpoint: &str) -> bool {
        self.permissions.is_empty()
            || self.permissions.iter().any(|p| endpoint.starts_with(p.as_str()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc.is_some_and(|exp| exp <= now)
    }
}

/// Hash a bearer token for storage or lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Input for issuing an API key.
#[derive(Debug, Clone)]
pub struct IssueApiKey {
    pub org_id: Uuid,
    pub label: String,
    pub permissions: Vec<String>,
    pub expires_utc: Option<DateTime<Utc>>,
}

/// Result of key issuance: the one-time plaintext token plus the stored
/// record.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub token: String,
    pub key: ApiKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(permissions: Vec<String>) -> ApiKey {
        ApiKey {
            key_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            label: "test".into(),
            token_hash: hash_token("mk_test"),
            permissions,
            is_active: true,
            expires_utc: None,
            total_requests: 0,
            last_used_utc: None,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn empty_permissions_allow_everything() {
        assert!(key(vec![]).allows("chat"));
        assert!(key(vec![]).allows("video/generate"));
    }

    #[test]
    fn permissions_restrict_by_prefix() {
        let k = key(vec!["chat".into()]);
        assert!(k.allows("chat"));
        assert!(k.allows("chat/completions"));
        assert!(!k.allows("video/generate"));
    }

    #[test]
    fn hash_is_stable_and_not_the_token() {
        let h = hash_token("mk_secret");
        assert_eq!(h, hash_token("mk_secret"));
        assert_ne!(h, "mk_secret");
        assert_eq!(h.len(), 64);
    }
}
