use async_trait::async_trait;

use crate::config::ApiKeyConfig;

/// Resolved caller of one inbound request. The core consumes only this;
/// raw credential material goes no further than redaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
    pub name: String,
}

/// External credential resolution. Implementations map a presented
/// credential to a caller identity or signal an invalid credential with
/// `None`.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Option<CallerIdentity>;
}

/// Config-backed resolver over a static key list.
#[derive(Debug, Default)]
pub struct StaticKeyResolver {
    keys: Vec<ApiKeyConfig>,
}

impl StaticKeyResolver {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl IdentityResolver for StaticKeyResolver {
    async fn resolve(&self, credential: &str) -> Option<CallerIdentity> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        self.keys
            .iter()
            .find(|key| key.enabled && key.token == token)
            .map(|key| CallerIdentity {
                id: key.id.clone(),
                name: key.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StaticKeyResolver {
        StaticKeyResolver::new(vec![
            ApiKeyConfig {
                id: "key-1".to_string(),
                name: "team-a".to_string(),
                token: "mrk-alpha".to_string(),
                enabled: true,
            },
            ApiKeyConfig {
                id: "key-2".to_string(),
                name: "team-b".to_string(),
                token: "mrk-beta".to_string(),
                enabled: false,
            },
        ])
    }

    #[tokio::test]
    async fn resolves_bearer_and_bare_tokens() {
        let resolver = resolver();
        let identity = resolver.resolve("Bearer mrk-alpha").await.expect("identity");
        assert_eq!(identity.id, "key-1");
        let identity = resolver.resolve("mrk-alpha").await.expect("identity");
        assert_eq!(identity.name, "team-a");
    }

    #[tokio::test]
    async fn rejects_unknown_and_disabled_keys() {
        let resolver = resolver();
        assert!(resolver.resolve("mrk-unknown").await.is_none());
        assert!(resolver.resolve("mrk-beta").await.is_none());
    }
}
