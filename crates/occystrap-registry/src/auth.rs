//! Registry authentication.
//!
//! Registries challenge with either `Basic` or `Bearer` in the
//! `WWW-Authenticate` header of a 401 response. For bearer auth the client
//! requests a short-lived token from the challenge's realm; tokens are
//! cached per scope and refreshed when a request comes back 401 again.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;

/// Username and password for a registry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Bearer-token flow: request a token from `realm`.
    Bearer {
        realm: String,
        service: String,
        /// Scope from the challenge, when the registry provided one.
        scope: Option<String>,
    },
    /// HTTP Basic.
    Basic,
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let trimmed = header.trim();
        if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        let params = trimmed.strip_prefix("Bearer ")?;

        let mut realm = String::new();
        let mut service = String::new();
        let mut scope = None;
        for part in params.split(',') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix("realm=") {
                realm = value.trim_matches('"').to_string();
            } else if let Some(value) = part.strip_prefix("service=") {
                service = value.trim_matches('"').to_string();
            } else if let Some(value) = part.strip_prefix("scope=") {
                scope = Some(value.trim_matches('"').to_string());
            }
        }

        if realm.is_empty() {
            return None;
        }
        Some(Self::Bearer {
            realm,
            service,
            scope,
        })
    }
}

/// Token response from a registry auth service.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    /// Some auth services use the OAuth2 field name instead.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// How to authenticate the next request.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    None,
    Bearer(String),
    Basic,
}

/// Thread-safe bearer-token cache, keyed by scope. Concurrent layer
/// fetches share one cache.
#[derive(Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenCache {
    pub async fn get(&self, scope: &str) -> Option<String> {
        self.tokens.read().await.get(scope).cloned()
    }

    pub async fn insert(&self, scope: &str, token: String) {
        self.tokens.write().await.insert(scope.to_string(), token);
    }

    pub async fn invalidate(&self, scope: &str) {
        self.tokens.write().await.remove(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/busybox:pull\"",
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: "registry.docker.io".to_string(),
                scope: Some("repository:library/busybox:pull".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_bearer_without_scope() {
        let challenge =
            Challenge::parse("Bearer realm=\"https://r.local/token\",service=\"r.local\"").unwrap();
        match challenge {
            Challenge::Bearer { scope, .. } => assert!(scope.is_none()),
            Challenge::Basic => panic!("expected bearer"),
        }
    }

    #[test]
    fn test_parse_basic_challenge() {
        assert_eq!(
            Challenge::parse("Basic realm=\"registry\""),
            Some(Challenge::Basic)
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Challenge::parse("Negotiate").is_none());
        assert!(Challenge::parse("Bearer service=\"x\"").is_none());
    }

    #[tokio::test]
    async fn test_token_cache() {
        let cache = TokenCache::default();
        assert!(cache.get("repository:a:pull").await.is_none());
        cache.insert("repository:a:pull", "tok".to_string()).await;
        assert_eq!(
            cache.get("repository:a:pull").await.as_deref(),
            Some("tok")
        );
        cache.invalidate("repository:a:pull").await;
        assert!(cache.get("repository:a:pull").await.is_none());
    }
}
