use std::path::PathBuf;
use thiserror::Error;

/// Upstream message that hides several unrelated root causes.
pub(crate) const ENTRY_NOT_FOUND_IN_CACHE: &str = "Entry not found in cache.";

/// Server errors produced when a Microsoft account is used with the password grant.
const MSA_ACCOUNT_ERRORS: &[&str] = &[
    "Server returned an unknown AccountType: undefined",
    "Server returned error in RSTR - ErrorCode: NONE : FaultMessage: NONE",
];

/// AADSTS codes that mean a second factor or an interactive prompt is required.
const SECOND_FACTOR_CODES: &[&str] = &["50072", "50074", "50076", "50077", "50078", "50079"];

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0}")]
    NoCachedCredential(String),

    #[error(
        "'{}' needed to acquire access tokens is missing. Please recover it or run 'login' with new certificate file",
        .0.display()
    )]
    MissingCredentialFile(PathBuf),

    #[error("{0}")]
    TokenAcquisitionFailed(String),

    /// Acquisition failure that the user can get past by switching to the device code flow.
    #[error("{0}")]
    InteractiveRequired(String),

    #[error(
        "The userId of '{token_user}' in access token doesn't match the command line username of '{requested}'"
    )]
    UsernameMismatch { token_user: String, requested: String },

    #[error("Failed to list tenants: {0}")]
    TenantListingFailed(String),

    #[error("Failed to list subscriptions for tenant {tenant}: {message}")]
    SubscriptionListingFailed { tenant: String, message: String },

    /// Another process was rewriting the token cache while we read it.
    #[error("The specified item could not be found in the keychain: {0}")]
    CacheContention(String),

    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether the CLI should suggest retrying with the interactive login.
    pub fn warn_to_user_interactive(&self) -> bool {
        matches!(self, AuthError::InteractiveRequired(_))
    }

    pub fn is_cache_contention(&self) -> bool {
        matches!(self, AuthError::CacheContention(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

fn is_msa_account_error(message: &str) -> bool {
    MSA_ACCOUNT_ERRORS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(message))
}

/// True when a password-grant failure means the account needs the interactive flow.
pub fn error_suggests_interactive_flow(message: &str) -> bool {
    let second_factor = SECOND_FACTOR_CODES
        .iter()
        .any(|code| message.contains(&format!("AADSTS{code}")));
    second_factor || is_msa_account_error(message)
}

/// Rewrite the ambiguous MSA server errors into something the user can act on.
pub fn polish_login_error(message: &str) -> String {
    if is_msa_account_error(message) {
        "Your account type requires to login using interactive flow. \
         Please rerun \"login\" command without -u/--username parameter"
            .to_string()
    } else {
        message.to_string()
    }
}

/// Classify a password-grant failure, tagging the ones that need interactive login.
pub fn classify_login_failure(err: AuthError) -> AuthError {
    let message = match &err {
        AuthError::TokenAcquisitionFailed(m) | AuthError::NoCachedCredential(m) => m.clone(),
        _ => return err,
    };
    if error_suggests_interactive_flow(&message) {
        AuthError::InteractiveRequired(polish_login_error(&message))
    } else {
        err
    }
}

/// Turn a failed cached-token lookup for a user into the "login again" error.
pub(crate) fn polish_token_error(err: &AuthError) -> AuthError {
    let mut better = String::from("We don't have a valid access token. Please run \"login\" again.");
    let original = err.to_string();
    if original == ENTRY_NOT_FOUND_IN_CACHE {
        return AuthError::NoCachedCredential(better);
    }
    better.push_str(" Original error:");
    better.push_str(&original);
    AuthError::TokenAcquisitionFailed(better)
}
