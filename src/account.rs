//! Account login orchestration.
//!
//! [`Account::load`] signs in with one of four [`LoginMode`]s and returns the
//! subscriptions the identity can see:
//!
//! - **Username/password**: password grant against the hinted tenant, then tenant
//!   resolution and per-tenant enumeration
//! - **Interactive**: device code flow, then the same resolution
//! - **Service principal**: caches the secret or certificate and enumerates the single
//!   tenant given
//! - **Cloud console**: imports access tokens minted elsewhere into the token cache and
//!   lists subscriptions of the token's tenant; not for regular logins
//!
//! A load either returns every subscription or an error. Nothing partial is returned.

use crate::arm::ResourceManager;
use crate::cache::{TokenCacheEntry, TokenQuery};
use crate::context::AuthenticationContext;
use crate::credentials::{
    Credential, ServicePrincipalSecret, UserTokenCredentials, create_service_principal_credentials,
};
use crate::environment::{CLI_CLIENT_ID, COMMON_TENANT, CloudEnvironment, normalize_user_name};
use crate::error::{AuthError, Result, classify_login_failure};
use crate::identity::UserCodeInfo;
use crate::jwt;
use crate::subscriptions::{Subscription, SubscriptionEnumerator, TenantSubscription, UserType};
use crate::tenants::TenantResolver;
use chrono::Utc;
use std::sync::Arc;

/// Lifetime given to imported console tokens; the console re-invokes us well before.
const CONSOLE_TOKEN_LIFETIME_HOURS: i64 = 24;

/// How to sign in. Exactly one mode applies per load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    UsernamePassword { username: String, password: String },
    Interactive,
    ServicePrincipal { app_id: String, secret: ServicePrincipalSecret },
    CloudConsole { tokens: Vec<String> },
}

impl LoginMode {
    /// Console tokens from `AZURE_CONSOLE_TOKENS`, separated by `;` or `,`.
    pub fn cloud_console_from_env() -> Result<Self> {
        let raw = std::env::var("AZURE_CONSOLE_TOKENS")
            .map_err(|_| AuthError::Config("AZURE_CONSOLE_TOKENS is not set".into()))?;
        Ok(Self::CloudConsole {
            tokens: split_console_tokens(&raw),
        })
    }
}

fn split_console_tokens(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub subscriptions: Vec<Subscription>,
    pub tenant_ids: Vec<String>,
}

type UserCodeHandler = Box<dyn Fn(&UserCodeInfo) + Send + Sync>;

pub struct Account {
    environment: CloudEnvironment,
    context: AuthenticationContext,
    tenants: TenantResolver,
    enumerator: SubscriptionEnumerator,
    on_user_code: Option<UserCodeHandler>,
}

impl Account {
    pub fn new(environment: CloudEnvironment, context: AuthenticationContext, arm: Arc<dyn ResourceManager>) -> Self {
        Self {
            tenants: TenantResolver::new(arm.clone()),
            enumerator: SubscriptionEnumerator::new(arm, context.clone(), environment.clone()),
            environment,
            context,
            on_user_code: None,
        }
    }

    /// Called with the device code message the user has to act on.
    pub fn with_user_code_handler(mut self, handler: impl Fn(&UserCodeInfo) + Send + Sync + 'static) -> Self {
        self.on_user_code = Some(Box::new(handler));
        self
    }

    pub fn context(&self) -> &AuthenticationContext {
        &self.context
    }

    pub async fn load(&self, tenant: Option<&str>, mode: LoginMode) -> Result<LoadResult> {
        let tenant = tenant.filter(|t| !t.is_empty()).unwrap_or(COMMON_TENANT);

        match mode {
            LoginMode::ServicePrincipal { app_id, secret } => {
                self.load_service_principal(&app_id, &secret, tenant).await
            }
            LoginMode::Interactive => self.load_interactive(tenant).await,
            LoginMode::CloudConsole { tokens } => self.load_cloud_console(&tokens).await,
            LoginMode::UsernamePassword { username, password } => {
                self.load_non_interactive(&normalize_user_name(&username), &password, tenant)
                    .await
            }
        }
    }

    fn finish(&self, listed: Vec<TenantSubscription>, user_type: UserType, tenant_ids: Vec<String>) -> LoadResult {
        let subscriptions = listed
            .into_iter()
            .map(|s| Subscription::from_listing(s, user_type, &self.environment))
            .collect();
        LoadResult {
            subscriptions,
            tenant_ids,
        }
    }

    async fn load_service_principal(
        &self,
        app_id: &str,
        secret: &ServicePrincipalSecret,
        tenant: &str,
    ) -> Result<LoadResult> {
        tracing::info!("Logging in service principal {} to tenant {}", app_id, tenant);
        let credential = create_service_principal_credentials(
            &self.context,
            self.environment.auth_config(tenant),
            app_id,
            secret,
        )
        .await?;

        let credential = Credential::ServicePrincipal(credential);
        let tenants = vec![tenant.to_string()];
        let listed = self
            .enumerator
            .enumerate(app_id, &tenants, Some(&credential))
            .await?;
        Ok(self.finish(listed, UserType::ServicePrincipal, tenants))
    }

    async fn load_interactive(&self, tenant: &str) -> Result<LoadResult> {
        let config = self.environment.auth_config(tenant);
        let user_code = self.context.acquire_user_code(&config).await?;

        tracing::info!("{}", user_code.message);
        tracing::debug!("Device code response: {:?}", user_code);
        if let Some(handler) = &self.on_user_code {
            handler(&user_code);
        }

        let response = self
            .context
            .acquire_token_with_device_code(&config, &user_code)
            .await?;
        let username = response.user_id.ok_or_else(|| {
            AuthError::TokenAcquisitionFailed("The device code login did not identify a user".into())
        })?;

        self.resolve_and_enumerate(&username, tenant, config).await
    }

    async fn load_non_interactive(&self, username: &str, password: &str, tenant: &str) -> Result<LoadResult> {
        let config = self.environment.auth_config(tenant);
        let response = self
            .context
            .acquire_token_with_username_password(&config, username, password)
            .await
            .map_err(classify_login_failure)?;

        let token_user = response.user_id.unwrap_or_else(|| username.to_string());
        let username = cross_check_username(username, &token_user)?;

        self.resolve_and_enumerate(&username, tenant, config).await
    }

    async fn resolve_and_enumerate(
        &self,
        username: &str,
        tenant: &str,
        config: crate::environment::AuthConfig,
    ) -> Result<LoadResult> {
        tracing::info!("Logged in as {}", username);
        let credential = UserTokenCredentials::new(self.context.clone(), config, username);
        let tenant_ids = self.tenants.resolve(Some(tenant), &credential).await?;
        let listed = self.enumerator.enumerate(username, &tenant_ids, None).await?;
        Ok(self.finish(listed, UserType::User, tenant_ids))
    }

    /// Import access tokens handed over by the cloud console and list subscriptions with them.
    ///
    /// The first token must be for Resource Manager; it decides the user and tenant.
    /// The rest are cached alongside it for other resources.
    async fn load_cloud_console(&self, tokens: &[String]) -> Result<LoadResult> {
        let (first, rest) = tokens
            .split_first()
            .ok_or_else(|| AuthError::Config("No cloud console tokens were supplied".into()))?;

        let arm_entry = self.build_token_entry(first)?;
        let authority = arm_entry.authority.clone().unwrap_or_default();
        let tenant = crate::environment::tenant_from_authority(&authority).to_string();
        let username = arm_entry.user_id.clone().unwrap_or_default();

        let mut new_entries = vec![arm_entry];
        for token in rest {
            new_entries.push(self.build_token_entry(token)?);
        }

        let existing = self
            .context
            .cache()
            .find(&TokenQuery::user(CLI_CLIENT_ID, &username, &authority))
            .await?;
        let kept = existing.into_iter().filter(|entry| {
            !new_entries
                .iter()
                .any(|new| new.resource.eq_ignore_ascii_case(&entry.resource))
        });
        let all_entries: Vec<TokenCacheEntry> = new_entries.iter().cloned().chain(kept).collect();
        self.context.cache().add(all_entries).await?;

        tracing::info!("Imported {} cloud console tokens for {}", new_entries.len(), username);

        let credential = Credential::User(UserTokenCredentials::new(
            self.context.clone(),
            self.environment.auth_config(&tenant),
            &username,
        ));
        let tenants = vec![tenant];
        let listed = self
            .enumerator
            .enumerate(&username, &tenants, Some(&credential))
            .await?;
        Ok(self.finish(listed, UserType::User, tenants))
    }

    /// Cache entry for a console-issued access token, built from its unverified claims.
    fn build_token_entry(&self, access_token: &str) -> Result<TokenCacheEntry> {
        let claims = jwt::decode_claims(access_token)?;
        let user = claims
            .unique_user()
            .ok_or_else(|| AuthError::InvalidToken("token has no unique_name claim".into()))?
            .to_string();
        let tid = claims
            .tid
            .clone()
            .ok_or_else(|| AuthError::InvalidToken("token has no tid claim".into()))?;
        let resource = claims
            .aud
            .clone()
            .ok_or_else(|| AuthError::InvalidToken("token has no aud claim".into()))?;

        Ok(TokenCacheEntry {
            client_id: Some(CLI_CLIENT_ID.to_string()),
            user_id: Some(user),
            authority: Some(self.environment.authority_url(&tid)),
            resource,
            access_token: Some(access_token.to_string()),
            token_type: Some("Bearer".to_string()),
            expires_on: Some(Utc::now() + chrono::Duration::hours(CONSOLE_TOKEN_LIFETIME_HOURS)),
            is_mrrt: true,
            oid: claims.oid,
            ..TokenCacheEntry::default()
        })
    }
}

/// The identity provider's casing wins, but only if it names the same user.
fn cross_check_username(requested: &str, token_user: &str) -> Result<String> {
    if requested.eq_ignore_ascii_case(token_user) {
        Ok(token_user.to_string())
    } else {
        Err(AuthError::UsernameMismatch {
            token_user: token_user.to_string(),
            requested: requested.to_string(),
        })
    }
}
