//! Resolution of per-direction provider credentials.

use async_trait::async_trait;
use moka::future::Cache;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::DeliveryError;
use crate::models::{Provider, ProviderCredentials};

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// `Ok(None)` means the direction has no usable credentials for this provider.
    async fn resolve(
        &self,
        provider: Provider,
        direction_id: Option<&str>,
    ) -> Result<Option<ProviderCredentials>, DeliveryError>;
}

/// Fixed credentials, keyed by provider and optionally by direction.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    defaults: HashMap<Provider, ProviderCredentials>,
    by_direction: HashMap<(Provider, String), ProviderCredentials>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, provider: Provider, credentials: ProviderCredentials) -> Self {
        self.defaults.insert(provider, credentials);
        self
    }

    pub fn with_direction(
        mut self,
        provider: Provider,
        direction_id: &str,
        credentials: ProviderCredentials,
    ) -> Self {
        self.by_direction
            .insert((provider, direction_id.to_string()), credentials);
        self
    }

    fn lookup(&self, provider: Provider, direction_id: Option<&str>) -> Option<ProviderCredentials> {
        direction_id
            .and_then(|id| self.by_direction.get(&(provider, id.to_string())))
            .or_else(|| self.defaults.get(&provider))
            .cloned()
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(
        &self,
        provider: Provider,
        direction_id: Option<&str>,
    ) -> Result<Option<ProviderCredentials>, DeliveryError> {
        Ok(self.lookup(provider, direction_id))
    }
}

/// Reads `direction_ad_credentials`, caching hits and misses for five minutes.
pub struct PgCredentialResolver {
    pool: PgPool,
    cache: Cache<(Provider, String), Option<ProviderCredentials>>,
    fallback: StaticCredentialResolver,
}

impl PgCredentialResolver {
    pub fn new(pool: PgPool) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(300))
            .max_capacity(10_000)
            .build();

        Self {
            pool,
            cache,
            fallback: StaticCredentialResolver::new(),
        }
    }

    /// Credentials used when a direction has no row of its own.
    pub fn with_fallback(mut self, fallback: StaticCredentialResolver) -> Self {
        self.fallback = fallback;
        self
    }

    async fn load(
        &self,
        provider: Provider,
        direction_id: &str,
    ) -> Result<Option<ProviderCredentials>, DeliveryError> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(
            r#"
            SELECT pixel_id, access_token
            FROM direction_ad_credentials
            WHERE direction_id = $1 AND provider = $2
            LIMIT 1
            "#,
        )
        .bind(direction_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(pixel_id, access_token)| {
            let creds = ProviderCredentials::new(pixel_id?, access_token?);
            creds.is_complete().then_some(creds)
        }))
    }
}

#[async_trait]
impl CredentialResolver for PgCredentialResolver {
    async fn resolve(
        &self,
        provider: Provider,
        direction_id: Option<&str>,
    ) -> Result<Option<ProviderCredentials>, DeliveryError> {
        let Some(direction_id) = direction_id else {
            return Ok(self.fallback.lookup(provider, None));
        };

        let key = (provider, direction_id.to_string());
        let found = match self.cache.get(&key).await {
            Some(cached) => cached,
            None => {
                let loaded = self.load(provider, direction_id).await?;
                self.cache.insert(key, loaded.clone()).await;
                loaded
            }
        };

        if found.is_none() {
            tracing::debug!(
                "No {} credentials stored for direction {}, using fallback",
                provider,
                direction_id
            );
        }
        Ok(found.or_else(|| self.fallback.lookup(provider, Some(direction_id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_prefers_direction() {
        let resolver = StaticCredentialResolver::new()
            .with_default(Provider::Meta, ProviderCredentials::new("default", "t0"))
            .with_direction(
                Provider::Meta,
                "dir-1",
                ProviderCredentials::new("dir-pixel", "t1"),
            );

        let direct = resolver
            .resolve(Provider::Meta, Some("dir-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(direct.pixel_id, "dir-pixel");

        let fallback = resolver
            .resolve(Provider::Meta, Some("dir-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.pixel_id, "default");

        assert!(resolver
            .resolve(Provider::TikTok, Some("dir-1"))
            .await
            .unwrap()
            .is_none());
    }
}
