//! Library interface for azprofile (azp)
//!
//! Signs users and service principals into Azure Active Directory, keeps their
//! tokens in a shared cache and resolves the subscriptions each identity can see
//! across tenants.

pub mod account;
pub mod arm;
pub mod cache;
pub mod context;
pub mod credentials;
pub mod environment;
pub mod error;
pub mod identity;
pub mod jwt;
pub mod profile;
pub mod subscriptions;
pub mod tenants;

// Re-export commonly used types
pub use account::{Account, LoadResult, LoginMode};
pub use cache::{FileTokenCache, MemoryTokenCache, TokenCache, TokenCacheEntry};
pub use context::AuthenticationContext;
pub use credentials::{ServicePrincipalSecret, TokenCredentials};
pub use environment::{AuthConfig, CloudEnvironment};
pub use error::{AuthError, Result};
pub use profile::Profile;
pub use subscriptions::Subscription;
