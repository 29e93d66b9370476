//! Persisted list of logged-in subscriptions (`azureProfile.json`).

use crate::context::AuthenticationContext;
use crate::error::{AuthError, Result};
use crate::subscriptions::{Subscription, UserType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PROFILE_FILE: &str = "azureProfile.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// Default profile location inside the config directory.
pub fn profile_path() -> PathBuf {
    crate::environment::config_dir().join(PROFILE_FILE)
}

impl Profile {
    /// Read the profile, treating a missing file as an empty profile.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn default_subscription(&self) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.is_default)
    }

    /// Merge freshly loaded subscriptions in, replacing the ones held by the same user.
    ///
    /// If no default remains afterwards the first added subscription becomes default.
    pub fn add_subscriptions(&mut self, added: Vec<Subscription>) {
        let previous_default = self
            .default_subscription()
            .map(|s| (s.id.clone(), s.user.name.to_lowercase()));

        for mut subscription in added.iter().cloned() {
            self.subscriptions.retain(|existing| {
                !(existing.id == subscription.id
                    && existing.user.name.eq_ignore_ascii_case(&subscription.user.name))
            });
            subscription.is_default = previous_default.as_ref().is_some_and(|(id, user)| {
                *id == subscription.id && *user == subscription.user.name.to_lowercase()
            });
            self.subscriptions.push(subscription);
        }

        if self.default_subscription().is_none() {
            if let Some(first) = added.first() {
                self.mark_default(&first.id);
            }
        }
    }

    fn mark_default(&mut self, id: &str) {
        let mut marked = false;
        for subscription in &mut self.subscriptions {
            subscription.is_default = !marked && subscription.id == id;
            marked |= subscription.is_default;
        }
    }

    /// Make the subscription with this id or name (case-insensitive) the default.
    pub fn set_default(&mut self, id_or_name: &str) -> Result<()> {
        let id = self
            .subscriptions
            .iter()
            .find(|s| s.id.eq_ignore_ascii_case(id_or_name) || s.name.eq_ignore_ascii_case(id_or_name))
            .map(|s| s.id.clone())
            .ok_or_else(|| AuthError::Config(format!("Subscription '{id_or_name}' not found")))?;
        self.mark_default(&id);
        Ok(())
    }

    /// Forget a user: drop their subscriptions and their cached tokens.
    ///
    /// Returns the number of subscriptions removed.
    pub async fn logout(&mut self, user_name: &str, context: &AuthenticationContext) -> Result<usize> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|s| s.user.name.eq_ignore_ascii_case(user_name));
        self.subscriptions = kept;

        if removed.is_empty() {
            return Err(AuthError::Config(format!("User '{user_name}' is not logged in")));
        }

        let was_default = removed.iter().any(|s| s.is_default);
        if was_default {
            if let Some(id) = self.subscriptions.first().map(|s| s.id.clone()) {
                self.mark_default(&id);
            }
        }

        // Cache entries are keyed by the exact casing stored on the subscription.
        let mut names: Vec<(&str, UserType)> = removed
            .iter()
            .map(|s| (s.user.name.as_str(), s.user.user_type))
            .collect();
        names.dedup();
        for (name, user_type) in names {
            match user_type {
                UserType::User => context.remove_cached_tokens(name).await?,
                UserType::ServicePrincipal => context.remove_service_principal(name, None).await?,
            }
        }

        tracing::info!("Logged out {} ({} subscriptions)", user_name, removed.len());
        Ok(removed.len())
    }
}
