//! Cache-aware token acquisition.
//!
//! [`AuthenticationContext`] sits between the credentials and the identity provider.
//! Every successful acquisition is written to the [`TokenCache`]; lookups for a user
//! are served from the cache while the access token is fresh and refreshed through the
//! identity provider once it is not. A refresh token flagged as multi-resource (MRRT)
//! is used to obtain tokens for resources the user has not requested before.

use crate::cache::{TokenCache, TokenCacheEntry, TokenQuery};
use crate::environment::AuthConfig;
use crate::error::{AuthError, ENTRY_NOT_FOUND_IN_CACHE, Result};
use crate::identity::{IdentityProvider, TokenResponse, UserCodeInfo};
use std::sync::Arc;

/// Tokens this close to expiry are refreshed instead of served from cache.
const EXPIRY_SKEW_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct AuthenticationContext {
    provider: Arc<dyn IdentityProvider>,
    cache: Arc<dyn TokenCache>,
}

fn is_fresh(entry: &TokenCacheEntry) -> bool {
    entry.access_token.is_some() && !entry.is_expired(chrono::Duration::minutes(EXPIRY_SKEW_MINUTES))
}

fn response_from_entry(entry: &TokenCacheEntry) -> Option<TokenResponse> {
    Some(TokenResponse {
        token_type: entry.token_type.clone().unwrap_or_else(|| "Bearer".to_string()),
        access_token: entry.access_token.clone()?,
        refresh_token: entry.refresh_token.clone(),
        expires_on: entry.expires_on?,
        resource: entry.resource.clone(),
        user_id: entry.user_id.clone(),
        oid: entry.oid.clone(),
    })
}

impl AuthenticationContext {
    pub fn new(provider: Arc<dyn IdentityProvider>, cache: Arc<dyn TokenCache>) -> Self {
        Self { provider, cache }
    }

    pub fn cache(&self) -> &Arc<dyn TokenCache> {
        &self.cache
    }

    /// Cache entry for a token obtained on behalf of `user_id`.
    pub fn user_entry(config: &AuthConfig, user_id: &str, response: &TokenResponse) -> TokenCacheEntry {
        TokenCacheEntry {
            client_id: Some(config.client_id.clone()),
            user_id: Some(user_id.to_string()),
            authority: Some(config.authority_url.clone()),
            resource: response.resource.clone(),
            access_token: Some(response.access_token.clone()),
            refresh_token: response.refresh_token.clone(),
            token_type: Some(response.token_type.clone()),
            expires_on: Some(response.expires_on),
            is_mrrt: response.refresh_token.is_some(),
            oid: response.oid.clone(),
            ..TokenCacheEntry::default()
        }
    }

    /// Token for `user_id` against `config.resource_id` in `config`'s tenant, from cache
    /// or by refreshing.
    ///
    /// Fails with `NoCachedCredential("Entry not found in cache.")` when neither a fresh
    /// token nor a usable refresh token is cached.
    pub async fn acquire_token(&self, config: &AuthConfig, user_id: &str) -> Result<TokenResponse> {
        // Refresh tokens obtained at the common authority are valid for any tenant, so
        // the lookup spans authorities and only the exact match is tenant-specific.
        let query = TokenQuery {
            client_id: Some(config.client_id.clone()),
            user_id: Some(user_id.to_string()),
            ..TokenQuery::default()
        };
        let mut entries = self.cache.find(&query).await?;
        entries.sort_by_key(|e| e.authority.as_deref() != Some(config.authority_url.as_str()));

        let exact = entries.iter().find(|e| {
            e.resource == config.resource_id
                && e.authority.as_deref() == Some(config.authority_url.as_str())
        });
        if let Some(entry) = exact.filter(|e| is_fresh(e)) {
            if let Some(response) = response_from_entry(entry) {
                tracing::debug!("Using cached token for {} ({})", user_id, config.resource_id);
                return Ok(response);
            }
        }

        let refresh_token = exact
            .and_then(|e| e.refresh_token.clone())
            .or_else(|| {
                entries
                    .iter()
                    .filter(|e| e.is_mrrt)
                    .find_map(|e| e.refresh_token.clone())
            })
            .ok_or_else(|| AuthError::NoCachedCredential(ENTRY_NOT_FOUND_IN_CACHE.to_string()))?;

        tracing::debug!("Refreshing token for {} ({})", user_id, config.resource_id);
        let response = self
            .provider
            .acquire_token_with_refresh_token(config, &refresh_token, &config.resource_id)
            .await?;

        self.cache
            .add(vec![Self::user_entry(config, user_id, &response)])
            .await?;
        Ok(response)
    }

    pub async fn acquire_token_with_username_password(
        &self,
        config: &AuthConfig,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse> {
        let response = self
            .provider
            .acquire_token_with_username_password(config, username, password)
            .await?;
        self.store_user_token(config, username, &response).await?;
        Ok(response)
    }

    pub async fn acquire_user_code(&self, config: &AuthConfig) -> Result<UserCodeInfo> {
        self.provider.acquire_user_code(config).await
    }

    pub async fn acquire_token_with_device_code(
        &self,
        config: &AuthConfig,
        user_code: &UserCodeInfo,
    ) -> Result<TokenResponse> {
        let response = self
            .provider
            .acquire_token_with_device_code(config, user_code)
            .await?;
        let user_id = response.user_id.clone().ok_or_else(|| {
            AuthError::TokenAcquisitionFailed("The device code login did not identify a user".into())
        })?;
        self.store_user_token(config, &user_id, &response).await?;
        Ok(response)
    }

    async fn store_user_token(&self, config: &AuthConfig, fallback_user: &str, response: &TokenResponse) -> Result<()> {
        let user_id = response.user_id.as_deref().unwrap_or(fallback_user);
        self.cache
            .add(vec![Self::user_entry(config, user_id, response)])
            .await
    }

    /// Client credential tokens are cached under the application id as client id.
    fn app_token_query(config: &AuthConfig, app_id: &str) -> TokenQuery {
        TokenQuery {
            client_id: Some(app_id.to_string()),
            authority: Some(config.authority_url.clone()),
            resource: Some(config.resource_id.clone()),
            ..TokenQuery::default()
        }
    }

    async fn cached_app_token(&self, config: &AuthConfig, app_id: &str) -> Result<Option<TokenResponse>> {
        let entries = self.cache.find(&Self::app_token_query(config, app_id)).await?;
        Ok(entries
            .iter()
            .filter(|e| e.user_id.is_none() && is_fresh(e))
            .find_map(response_from_entry))
    }

    async fn store_app_token(&self, config: &AuthConfig, app_id: &str, response: &TokenResponse) -> Result<()> {
        let entry = TokenCacheEntry {
            client_id: Some(app_id.to_string()),
            authority: Some(config.authority_url.clone()),
            resource: response.resource.clone(),
            access_token: Some(response.access_token.clone()),
            token_type: Some(response.token_type.clone()),
            expires_on: Some(response.expires_on),
            ..TokenCacheEntry::default()
        };
        self.cache.add(vec![entry]).await
    }

    pub async fn acquire_token_with_client_credentials(
        &self,
        config: &AuthConfig,
        app_id: &str,
        secret: &str,
    ) -> Result<TokenResponse> {
        if let Some(cached) = self.cached_app_token(config, app_id).await? {
            return Ok(cached);
        }
        let response = self
            .provider
            .acquire_token_with_client_credentials(config, app_id, secret)
            .await?;
        self.store_app_token(config, app_id, &response).await?;
        Ok(response)
    }

    pub async fn acquire_token_with_client_certificate(
        &self,
        config: &AuthConfig,
        app_id: &str,
        certificate: &str,
        thumbprint: &str,
    ) -> Result<TokenResponse> {
        if let Some(cached) = self.cached_app_token(config, app_id).await? {
            return Ok(cached);
        }
        let response = self
            .provider
            .acquire_token_with_client_certificate(config, app_id, certificate, thumbprint)
            .await?;
        self.store_app_token(config, app_id, &response).await?;
        Ok(response)
    }

    /// Drop every cached token of a user, across tenants.
    pub async fn remove_cached_tokens(&self, user_id: &str) -> Result<()> {
        let query = TokenQuery {
            user_id: Some(user_id.to_string()),
            ..TokenQuery::default()
        };
        let entries = self.cache.find(&query).await?;
        tracing::debug!("Removing {} cached tokens for {}", entries.len(), user_id);
        self.cache.remove(&entries).await
    }

    /// Drop the cached key and tokens of a service principal in one tenant.
    pub async fn remove_service_principal(&self, app_id: &str, tenant: Option<&str>) -> Result<()> {
        let key_query = TokenQuery {
            service_principal_id: Some(app_id.to_string()),
            service_principal_tenant: tenant.map(str::to_string),
            ..TokenQuery::default()
        };
        let mut entries = self.cache.find(&key_query).await?;

        let token_query = TokenQuery {
            client_id: Some(app_id.to_string()),
            ..TokenQuery::default()
        };
        entries.extend(
            self.cache
                .find(&token_query)
                .await?
                .into_iter()
                .filter(|e| {
                    e.user_id.is_none()
                        && tenant.is_none_or(|t| {
                            e.authority
                                .as_deref()
                                .is_some_and(|a| crate::environment::tenant_from_authority(a) == t)
                        })
                }),
        );

        self.cache.remove(&entries).await
    }
}
