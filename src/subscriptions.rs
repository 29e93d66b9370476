//! Subscription enumeration across tenants.
//!
//! Tenants are visited one at a time, in the order given. When no credential is
//! supplied a fresh user credential is built for each tenant; doing this serially
//! keeps credential construction free of shared state. One failing tenant fails the
//! whole enumeration, so callers never see a partial list.

use crate::arm::{ResourceManager, SubscriptionInfo};
use crate::context::AuthenticationContext;
use crate::credentials::{Credential, TokenCredentials, UserTokenCredentials};
use crate::environment::CloudEnvironment;
use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserType {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "servicePrincipal")]
    ServicePrincipal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUser {
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
}

/// A subscription visible to one identity in one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub user: SubscriptionUser,
    pub state: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "environmentName")]
    pub environment_name: String,
    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
}

impl Subscription {
    pub fn from_listing(listed: TenantSubscription, user_type: UserType, environment: &CloudEnvironment) -> Self {
        Self {
            name: listed.info.name().to_string(),
            id: listed.info.subscription_id,
            user: SubscriptionUser {
                name: listed.username,
                user_type,
            },
            state: listed.info.state,
            tenant_id: listed.tenant_id,
            environment_name: environment.name.clone(),
            is_default: false,
        }
    }
}

/// A listed subscription tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSubscription {
    pub info: SubscriptionInfo,
    pub tenant_id: String,
    pub username: String,
}

pub struct SubscriptionEnumerator {
    arm: Arc<dyn ResourceManager>,
    context: AuthenticationContext,
    environment: CloudEnvironment,
}

impl SubscriptionEnumerator {
    pub fn new(arm: Arc<dyn ResourceManager>, context: AuthenticationContext, environment: CloudEnvironment) -> Self {
        Self {
            arm,
            context,
            environment,
        }
    }

    pub async fn enumerate(
        &self,
        username: &str,
        tenants: &[String],
        prebuilt: Option<&Credential>,
    ) -> Result<Vec<TenantSubscription>> {
        let mut subscriptions = Vec::new();

        for tenant in tenants {
            let listed = match prebuilt {
                Some(credential) => self.list_in_tenant(tenant, credential).await?,
                None => {
                    let credential = UserTokenCredentials::new(
                        self.context.clone(),
                        self.environment.auth_config(tenant),
                        username,
                    );
                    self.list_in_tenant(tenant, &credential).await?
                }
            };

            tracing::debug!("Tenant {} has {} subscriptions", tenant, listed.len());
            subscriptions.extend(listed.into_iter().map(|info| TenantSubscription {
                info,
                tenant_id: tenant.clone(),
                username: username.to_string(),
            }));
        }

        Ok(subscriptions)
    }

    async fn list_in_tenant(&self, tenant: &str, credential: &dyn TokenCredentials) -> Result<Vec<SubscriptionInfo>> {
        self.arm
            .list_subscriptions(credential)
            .await
            .map_err(|e| AuthError::SubscriptionListingFailed {
                tenant: tenant.to_string(),
                message: e.to_string(),
            })
    }
}
