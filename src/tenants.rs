//! Resolve which tenants a login should enumerate.

use crate::arm::ResourceManager;
use crate::credentials::TokenCredentials;
use crate::environment::COMMON_TENANT;
use crate::error::{AuthError, Result};
use std::sync::Arc;

pub struct TenantResolver {
    arm: Arc<dyn ResourceManager>,
}

impl TenantResolver {
    pub fn new(arm: Arc<dyn ResourceManager>) -> Self {
        Self { arm }
    }

    /// A concrete tenant hint is returned as-is without any network call. For the
    /// `common` tenant (or no hint) every tenant visible to `credential` is listed,
    /// in response order. A failed listing fails the whole resolution.
    pub async fn resolve(&self, tenant_hint: Option<&str>, credential: &dyn TokenCredentials) -> Result<Vec<String>> {
        if let Some(tenant) = tenant_hint.filter(|t| !t.is_empty() && *t != COMMON_TENANT) {
            return Ok(vec![tenant.to_string()]);
        }

        let tenants = self
            .arm
            .list_tenants(credential)
            .await
            .map_err(|e| AuthError::TenantListingFailed(e.to_string()))?;

        tracing::debug!("Found {} tenants", tenants.len());
        Ok(tenants.into_iter().map(|t| t.tenant_id).collect())
    }
}
