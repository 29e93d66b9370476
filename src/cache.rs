//! Persisted token cache.
//!
//! The cache holds one [`TokenCacheEntry`] per (client id, user or service principal,
//! tenant, resource). Adding an entry whose key already exists replaces the old one.
//! Lookups are partial-attribute matches through [`TokenQuery`]; the cache never looks at
//! expiry, that decision belongs to the acquisition logic.
//!
//! Two backends are provided:
//! - [`MemoryTokenCache`] for tests and short-lived processes
//! - [`FileTokenCache`], a JSON array in `~/.azure/accessTokens.json` shared by every
//!   CLI process on the machine

use crate::environment::tenant_from_authority;
use crate::error::{AuthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

pub const TOKEN_CACHE_FILE: &str = "accessTokens.json";

/// One cached token, or a cached service principal secret / certificate reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCacheEntry {
    #[serde(rename = "_clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "servicePrincipalId", default, skip_serializing_if = "Option::is_none")]
    pub service_principal_id: Option<String>,
    #[serde(rename = "servicePrincipalTenant", default, skip_serializing_if = "Option::is_none")]
    pub service_principal_tenant: Option<String>,
    #[serde(rename = "_authority", default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default)]
    pub resource: String,
    /// Bearer token for users; the client secret for service principals.
    #[serde(rename = "accessToken", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "tokenType", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(rename = "expiresOn", default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
    #[serde(rename = "isMRRT", default)]
    pub is_mrrt: bool,
    #[serde(rename = "certificateFile", default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
}

/// Composite identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub client_id: Option<String>,
    pub identity: Option<String>,
    pub tenant: Option<String>,
    pub resource: String,
}

impl TokenCacheEntry {
    pub fn key(&self) -> EntryKey {
        let identity = self
            .user_id
            .clone()
            .or_else(|| self.service_principal_id.clone());
        let tenant = self.service_principal_tenant.clone().or_else(|| {
            self.authority
                .as_deref()
                .map(|a| tenant_from_authority(a).to_string())
        });
        EntryKey {
            client_id: self.client_id.clone(),
            identity,
            tenant,
            resource: self.resource.clone(),
        }
    }

    /// Whether the access token expires within `skew` from now. Entries without
    /// an expiry are treated as expired.
    pub fn is_expired(&self, skew: chrono::Duration) -> bool {
        match self.expires_on {
            Some(expires_on) => expires_on <= Utc::now() + skew,
            None => true,
        }
    }
}

/// Partial filter over cache entries; every `Some` field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenQuery {
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub service_principal_id: Option<String>,
    pub service_principal_tenant: Option<String>,
    pub authority: Option<String>,
    pub resource: Option<String>,
}

impl TokenQuery {
    /// Entries for a user signed in through one client against one authority.
    pub fn user(client_id: &str, user_id: &str, authority: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            user_id: Some(user_id.to_string()),
            authority: Some(authority.to_string()),
            ..Self::default()
        }
    }

    /// The cached key of a service principal in a tenant, whatever its resource.
    pub fn service_principal(app_id: &str, tenant: &str) -> Self {
        Self {
            service_principal_id: Some(app_id.to_string()),
            service_principal_tenant: Some(tenant.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &TokenCacheEntry) -> bool {
        fn eq(want: &Option<String>, have: &Option<String>) -> bool {
            match want {
                Some(w) => have.as_deref() == Some(w.as_str()),
                None => true,
            }
        }

        eq(&self.client_id, &entry.client_id)
            && eq(&self.user_id, &entry.user_id)
            && eq(&self.service_principal_id, &entry.service_principal_id)
            && eq(&self.service_principal_tenant, &entry.service_principal_tenant)
            && eq(&self.authority, &entry.authority)
            && self
                .resource
                .as_ref()
                .is_none_or(|r| *r == entry.resource)
    }
}

/// Durable store of token cache entries.
///
/// `add` and `remove` must be atomic with respect to `find`: a concurrent reader sees
/// either the whole previous set or the whole new one.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn find(&self, query: &TokenQuery) -> Result<Vec<TokenCacheEntry>>;
    async fn add(&self, entries: Vec<TokenCacheEntry>) -> Result<()>;
    async fn remove(&self, entries: &[TokenCacheEntry]) -> Result<()>;
}

/// Merge `added` into `entries`, replacing anything with the same key.
fn upsert(entries: &mut Vec<TokenCacheEntry>, added: Vec<TokenCacheEntry>) {
    for entry in added {
        let key = entry.key();
        entries.retain(|e| e.key() != key);
        entries.push(entry);
    }
}

fn without(entries: &mut Vec<TokenCacheEntry>, removed: &[TokenCacheEntry]) {
    let keys: Vec<EntryKey> = removed.iter().map(TokenCacheEntry::key).collect();
    entries.retain(|e| !keys.contains(&e.key()));
}

/// In-process token cache.
#[derive(Default)]
pub struct MemoryTokenCache {
    entries: RwLock<Vec<TokenCacheEntry>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<TokenCacheEntry>) -> Self {
        let mut cache = Vec::new();
        upsert(&mut cache, entries);
        Self {
            entries: RwLock::new(cache),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn find(&self, query: &TokenQuery) -> Result<Vec<TokenCacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| query.matches(e)).cloned().collect())
    }

    async fn add(&self, entries: Vec<TokenCacheEntry>) -> Result<()> {
        upsert(&mut *self.entries.write().await, entries);
        Ok(())
    }

    async fn remove(&self, entries: &[TokenCacheEntry]) -> Result<()> {
        without(&mut *self.entries.write().await, entries);
        Ok(())
    }
}

/// Token cache persisted as a JSON array, shared between CLI processes.
///
/// Writes go to a sibling temp file that is renamed over the cache, so another
/// process reading concurrently observes either the old or the new file.
pub struct FileTokenCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Cache file in the default config directory.
    pub fn in_config_dir() -> Self {
        Self::new(crate::environment::config_dir().join(TOKEN_CACHE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<TokenCacheEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // `store` always writes at least `[]`; an empty file is a writer that has
        // truncated but not yet rewritten it.
        if content.trim().is_empty() {
            return Err(AuthError::CacheContention(self.path.display().to_string()));
        }

        serde_json::from_str(&content).map_err(|e| {
            if e.is_eof() {
                // A writer that does not rename atomically is halfway through.
                AuthError::CacheContention(self.path.display().to_string())
            } else {
                AuthError::Json(e)
            }
        })
    }

    async fn store(&self, entries: &[TokenCacheEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!("Wrote {} token cache entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TokenCache for FileTokenCache {
    async fn find(&self, query: &TokenQuery) -> Result<Vec<TokenCacheEntry>> {
        let entries = self.load().await?;
        Ok(entries.into_iter().filter(|e| query.matches(e)).collect())
    }

    async fn add(&self, added: Vec<TokenCacheEntry>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        upsert(&mut entries, added);
        self.store(&entries).await
    }

    async fn remove(&self, removed: &[TokenCacheEntry]) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        without(&mut entries, removed);
        self.store(&entries).await
    }
}
