//! Cloud endpoints and per-tenant authentication settings.
//!
//! A [`CloudEnvironment`] names the Active Directory authority host and the
//! Resource Manager endpoint for one Azure cloud. Every login attempt derives an
//! immutable [`AuthConfig`] from it for the tenant being authenticated against.
//!
//! Endpoints can be overridden through environment variables:
//! - `AZURE_ENVIRONMENT`: one of the built-in cloud names
//! - `AZURE_AD_ENDPOINT`: Active Directory authority host
//! - `AZURE_ARM_ENDPOINT`: Resource Manager endpoint
//! - `AZURE_CONFIG_DIR`: where the profile and token cache live

use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The multi-tenant authority segment.
pub const COMMON_TENANT: &str = "common";

/// Public client id of the cross-platform CLI application registration.
pub const CLI_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

/// Resource name under which service principal secrets and certificates are cached.
pub const SERVICE_PRINCIPAL_KEY_RESOURCE: &str = "Azure Cli Service Principal Key Cache";

pub const AZURE_CLOUD: &str = "AzureCloud";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEnvironment {
    pub name: String,
    pub active_directory_endpoint_url: String,
    pub resource_manager_endpoint_url: String,
    pub active_directory_resource_id: String,
}

/// Settings for one authentication attempt against one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub tenant_id: String,
    pub authority_url: String,
    pub resource_id: String,
    pub client_id: String,
}

impl CloudEnvironment {
    /// Look up one of the built-in clouds by name (case-insensitive).
    pub fn named(name: &str) -> Option<Self> {
        let (name, ad, arm, resource) = match name.to_ascii_lowercase().as_str() {
            "azurecloud" => (
                AZURE_CLOUD,
                "https://login.microsoftonline.com",
                "https://management.azure.com/",
                "https://management.core.windows.net/",
            ),
            "azurechinacloud" => (
                "AzureChinaCloud",
                "https://login.chinacloudapi.cn",
                "https://management.chinacloudapi.cn/",
                "https://management.core.chinacloudapi.cn/",
            ),
            "azureusgovernment" => (
                "AzureUSGovernment",
                "https://login.microsoftonline.us",
                "https://management.usgovcloudapi.net/",
                "https://management.core.usgovcloudapi.net/",
            ),
            "azuregermancloud" => (
                "AzureGermanCloud",
                "https://login.microsoftonline.de",
                "https://management.microsoftazure.de/",
                "https://management.core.cloudapi.de/",
            ),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            active_directory_endpoint_url: ad.to_string(),
            resource_manager_endpoint_url: arm.to_string(),
            active_directory_resource_id: resource.to_string(),
        })
    }

    /// Build the environment from `AZURE_ENVIRONMENT` and the endpoint overrides.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("AZURE_ENVIRONMENT").unwrap_or_else(|_| AZURE_CLOUD.to_string());
        let mut env = Self::named(&name)
            .ok_or_else(|| AuthError::Config(format!("Unknown cloud environment: {name}")))?;

        if let Ok(ad) = std::env::var("AZURE_AD_ENDPOINT") {
            env.active_directory_endpoint_url = ad.trim_end_matches('/').to_string();
        }
        if let Ok(arm) = std::env::var("AZURE_ARM_ENDPOINT") {
            env.resource_manager_endpoint_url = arm;
        }

        tracing::debug!("Using cloud environment {}", env.name);
        Ok(env)
    }

    pub fn auth_config(&self, tenant: &str) -> AuthConfig {
        AuthConfig {
            tenant_id: tenant.to_string(),
            authority_url: self.authority_url(tenant),
            resource_id: self.active_directory_resource_id.clone(),
            client_id: CLI_CLIENT_ID.to_string(),
        }
    }

    pub fn authority_url(&self, tenant: &str) -> String {
        format!("{}/{}", self.active_directory_endpoint_url, tenant)
    }
}

impl Default for CloudEnvironment {
    fn default() -> Self {
        Self::named(AZURE_CLOUD).expect("AzureCloud is a built-in environment")
    }
}

/// Directory holding the profile and token cache (`~/.azure` or `$AZURE_CONFIG_DIR`).
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("AZURE_CONFIG_DIR") {
        PathBuf::from(dir)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".azure")
    } else {
        PathBuf::from(".azure")
    }
}

/// Expand a bare organisational domain: `user@contoso` becomes `user@contoso.onmicrosoft.com`.
pub fn normalize_user_name(username: &str) -> String {
    match username.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() && !domain.contains(['.', '@']) => {
            format!("{user}@{domain}.onmicrosoft.com")
        }
        _ => username.to_string(),
    }
}

/// Tenant segment of an authority URL (`https://login.microsoftonline.com/<tenant>`).
pub fn tenant_from_authority(authority: &str) -> &str {
    authority.trim_end_matches('/').rsplit('/').next().unwrap_or(authority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_authority() {
        let env = CloudEnvironment::default();
        let config = env.auth_config("contoso.onmicrosoft.com");
        assert_eq!(
            config.authority_url,
            "https://login.microsoftonline.com/contoso.onmicrosoft.com"
        );
        assert_eq!(config.client_id, CLI_CLIENT_ID);
        assert_eq!(config.resource_id, "https://management.core.windows.net/");
    }

    #[test]
    fn test_named_environments() {
        assert!(CloudEnvironment::named("azurechinacloud").is_some());
        assert!(CloudEnvironment::named("AzureUSGovernment").is_some());
        assert!(CloudEnvironment::named("mars").is_none());
    }

    #[test]
    fn test_normalize_user_name() {
        assert_eq!(normalize_user_name("admin@contoso"), "admin@contoso.onmicrosoft.com");
        assert_eq!(normalize_user_name("admin@contoso.com"), "admin@contoso.com");
        assert_eq!(normalize_user_name("admin"), "admin");
        assert_eq!(normalize_user_name("admin@"), "admin@");
    }

    #[test]
    fn test_tenant_from_authority() {
        assert_eq!(tenant_from_authority("https://login.microsoftonline.com/t1"), "t1");
        assert_eq!(tenant_from_authority("https://login.microsoftonline.com/t1/"), "t1");
    }
}
