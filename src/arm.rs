//! Azure Resource Manager client for tenant and subscription listing.
//!
//! Only the two read-only listing calls account resolution needs are implemented.
//! Both follow `nextLink` until the collection is exhausted and authenticate with
//! whatever [`TokenCredentials`] the caller passes in, so the same client serves
//! users and service principals across tenants.

use crate::credentials::TokenCredentials;
use crate::error::{AuthError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_VERSION: &str = "2016-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
}

/// A subscription as returned by the subscriptions API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Older API versions name the subscription here instead of `displayName`.
    #[serde(rename = "subscriptionName", default, skip_serializing_if = "Option::is_none")]
    pub subscription_name: Option<String>,
}

impl SubscriptionInfo {
    pub fn name(&self) -> &str {
        match self.subscription_name.as_deref() {
            Some(name) if self.display_name.is_empty() => name,
            _ => &self.display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn list_tenants(&self, credential: &dyn TokenCredentials) -> Result<Vec<TenantInfo>>;

    async fn list_subscriptions(&self, credential: &dyn TokenCredentials) -> Result<Vec<SubscriptionInfo>>;
}

#[derive(Clone)]
pub struct ArmClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ArmClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(format!("azprofile/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_all<T: DeserializeOwned>(&self, path: &str, credential: &dyn TokenCredentials) -> Result<Vec<T>> {
        let token = credential.retrieve_token_from_cache().await?;
        let mut url = format!("{}/{}?api-version={}", self.endpoint, path, API_VERSION);
        let mut items = Vec::new();

        loop {
            tracing::debug!("GET {}", url);
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::AUTHORIZATION, token.authorization())
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AuthError::Other(anyhow::anyhow!(
                    "GET {} failed with {}: {}",
                    path,
                    status,
                    body
                )));
            }

            let page: Page<T> = response.json().await?;
            items.extend(page.value);

            match page.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl ResourceManager for ArmClient {
    async fn list_tenants(&self, credential: &dyn TokenCredentials) -> Result<Vec<TenantInfo>> {
        self.list_all("tenants", credential).await
    }

    async fn list_subscriptions(&self, credential: &dyn TokenCredentials) -> Result<Vec<SubscriptionInfo>> {
        self.list_all("subscriptions", credential).await
    }
}
