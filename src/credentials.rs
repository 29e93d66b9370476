//! Bearer token credentials for users and service principals.
//!
//! Both kinds answer the same question, "give me a token for the configured resource",
//! through [`TokenCredentials::retrieve_token_from_cache`]. A user credential asks the
//! [`AuthenticationContext`] for a cached or refreshed token. A service principal
//! credential looks up its cached secret or certificate path and runs the client
//! credentials grant with it.
//!
//! Any failed acquisition removes the cache entries of the identity that failed so
//! that the next `login` starts from a clean slate.

use crate::cache::{TokenCacheEntry, TokenQuery};
use crate::context::AuthenticationContext;
use crate::environment::{AuthConfig, SERVICE_PRINCIPAL_KEY_RESOURCE};
use crate::error::{AuthError, Result, polish_token_error};
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token_type: String,
    pub access_token: String,
}

impl AccessToken {
    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[async_trait]
pub trait TokenCredentials: Send + Sync {
    async fn retrieve_token_from_cache(&self) -> Result<AccessToken>;

    fn auth_config(&self) -> &AuthConfig;
}

/// How a service principal proves its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePrincipalSecret {
    Secret(String),
    Certificate { file: PathBuf, thumbprint: String },
}

pub struct UserTokenCredentials {
    auth_config: AuthConfig,
    user_id: String,
    context: AuthenticationContext,
}

impl UserTokenCredentials {
    pub fn new(context: AuthenticationContext, auth_config: AuthConfig, user_id: impl Into<String>) -> Self {
        Self {
            auth_config,
            user_id: user_id.into(),
            context,
        }
    }
}

#[async_trait]
impl TokenCredentials for UserTokenCredentials {
    async fn retrieve_token_from_cache(&self) -> Result<AccessToken> {
        let result = match self.context.acquire_token(&self.auth_config, &self.user_id).await {
            Err(e) if e.is_cache_contention() => {
                // Another CLI process sharing the cache was mid-write; one retry is enough.
                tracing::debug!("Token cache busy, retrying lookup for {}", self.user_id);
                self.context.acquire_token(&self.auth_config, &self.user_id).await
            }
            other => other,
        };

        match result {
            Ok(response) => Ok(AccessToken {
                token_type: response.token_type,
                access_token: response.access_token,
            }),
            Err(err) => {
                // The refresh token that failed may belong to any authority.
                if let Err(remove_err) = self.context.remove_cached_tokens(&self.user_id).await {
                    tracing::warn!("Failed to remove cached tokens for {}: {}", self.user_id, remove_err);
                }
                Err(polish_token_error(&err))
            }
        }
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.auth_config
    }
}

pub struct ServicePrincipalTokenCredentials {
    auth_config: AuthConfig,
    app_id: String,
    context: AuthenticationContext,
}

enum CachedKey {
    Secret(String),
    Certificate { file: PathBuf, thumbprint: String },
}

impl ServicePrincipalTokenCredentials {
    pub fn new(context: AuthenticationContext, auth_config: AuthConfig, app_id: impl Into<String>) -> Self {
        Self {
            auth_config,
            app_id: app_id.into(),
            context,
        }
    }

    async fn load_key(&self) -> Result<CachedKey> {
        let query = TokenQuery::service_principal(&self.app_id, &self.auth_config.tenant_id);
        let no_key = |reason: String| {
            AuthError::NoCachedCredential(format!(
                "No service key found for appid {}. Error {}",
                self.app_id, reason
            ))
        };

        let entries = self
            .context
            .cache()
            .find(&query)
            .await
            .map_err(|e| no_key(e.to_string()))?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| no_key("No service principal key found".to_string()))?;

        if let Some(secret) = entry.access_token {
            Ok(CachedKey::Secret(secret))
        } else if let Some(file) = entry.certificate_file {
            Ok(CachedKey::Certificate {
                file,
                thumbprint: entry.thumbprint.unwrap_or_default(),
            })
        } else {
            Err(no_key(
                "The cached service principal entry misses either secret or certificate file path".to_string(),
            ))
        }
    }
}

/// Certificate files written on Windows may start with a UTF-8 byte order mark.
fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

#[async_trait]
impl TokenCredentials for ServicePrincipalTokenCredentials {
    async fn retrieve_token_from_cache(&self) -> Result<AccessToken> {
        let key = self.load_key().await?;
        let config = &self.auth_config;

        let result = match key {
            CachedKey::Secret(secret) => {
                self.context
                    .acquire_token_with_client_credentials(config, &self.app_id, &secret)
                    .await
            }
            CachedKey::Certificate { file, thumbprint } => {
                if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
                    return Err(AuthError::MissingCredentialFile(file));
                }
                let content = tokio::fs::read_to_string(&file).await?;
                self.context
                    .acquire_token_with_client_certificate(config, &self.app_id, strip_bom(&content), &thumbprint)
                    .await
            }
        };

        match result {
            Ok(response) => Ok(AccessToken {
                token_type: response.token_type,
                access_token: response.access_token,
            }),
            Err(err) => {
                // A rejected key must not survive in the cache.
                if let Err(remove_err) = self
                    .context
                    .remove_service_principal(&self.app_id, Some(&config.tenant_id))
                    .await
                {
                    tracing::warn!(
                        "Failed to clean up invalid credentials for service principal {}: {}",
                        self.app_id,
                        remove_err
                    );
                }
                Err(AuthError::TokenAcquisitionFailed(format!(
                    "Unable to acquire token due to error: {err}"
                )))
            }
        }
    }

    fn auth_config(&self) -> &AuthConfig {
        &self.auth_config
    }
}

/// A credential of either kind, owned by the account for one login.
pub enum Credential {
    User(UserTokenCredentials),
    ServicePrincipal(ServicePrincipalTokenCredentials),
}

#[async_trait]
impl TokenCredentials for Credential {
    async fn retrieve_token_from_cache(&self) -> Result<AccessToken> {
        match self {
            Credential::User(c) => c.retrieve_token_from_cache().await,
            Credential::ServicePrincipal(c) => c.retrieve_token_from_cache().await,
        }
    }

    fn auth_config(&self) -> &AuthConfig {
        match self {
            Credential::User(c) => c.auth_config(),
            Credential::ServicePrincipal(c) => c.auth_config(),
        }
    }
}

/// Cache the service principal's secret or certificate path and build its credential.
///
/// Tokens minted with an identical key stay cached.
pub async fn create_service_principal_credentials(
    context: &AuthenticationContext,
    auth_config: AuthConfig,
    app_id: &str,
    secret: &ServicePrincipalSecret,
) -> Result<ServicePrincipalTokenCredentials> {
    let mut entry = TokenCacheEntry {
        service_principal_id: Some(app_id.to_string()),
        service_principal_tenant: Some(auth_config.tenant_id.clone()),
        resource: SERVICE_PRINCIPAL_KEY_RESOURCE.to_string(),
        ..TokenCacheEntry::default()
    };
    match secret {
        ServicePrincipalSecret::Secret(secret) => entry.access_token = Some(secret.clone()),
        ServicePrincipalSecret::Certificate { file, thumbprint } => {
            entry.certificate_file = Some(file.clone());
            entry.thumbprint = Some(thumbprint.clone());
        }
    }

    let existing = context
        .cache()
        .find(&TokenQuery::service_principal(app_id, &auth_config.tenant_id))
        .await?;
    let unchanged = existing.iter().any(|cached| {
        cached.access_token == entry.access_token
            && cached.certificate_file == entry.certificate_file
            && cached.thumbprint == entry.thumbprint
    });

    if unchanged {
        tracing::debug!("Reusing cached key for service principal {}", app_id);
    } else {
        // A new key invalidates tokens minted with the previous one.
        context
            .remove_service_principal(app_id, Some(&auth_config.tenant_id))
            .await?;
        context.cache().add(vec![entry]).await?;
    }

    Ok(ServicePrincipalTokenCredentials::new(
        context.clone(),
        auth_config,
        app_id,
    ))
}
