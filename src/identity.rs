//! Identity provider client.
//!
//! [`IdentityProvider`] is the seam between account resolution and the OAuth2
//! endpoints of Azure Active Directory. [`AadClient`] talks to the v1 endpoints
//! (`/oauth2/token`, `/oauth2/devicecode`) of the tenant-specific authority held in
//! each [`AuthConfig`]. Nothing here reads or writes the token cache; see
//! [`crate::context::AuthenticationContext`] for that.

use crate::environment::AuthConfig;
use crate::error::{AuthError, Result};
use crate::jwt;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Result of a successful token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_on: DateTime<Utc>,
    pub resource: String,
    pub user_id: Option<String>,
    pub oid: Option<String>,
}

/// Device code handed to the user for the out-of-band login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCodeInfo {
    pub user_code: String,
    pub device_code: String,
    pub verification_url: String,
    pub expires_in: u64,
    pub interval: u64,
    pub message: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn acquire_token_with_username_password(
        &self,
        config: &AuthConfig,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse>;

    async fn acquire_token_with_refresh_token(
        &self,
        config: &AuthConfig,
        refresh_token: &str,
        resource: &str,
    ) -> Result<TokenResponse>;

    async fn acquire_token_with_client_credentials(
        &self,
        config: &AuthConfig,
        app_id: &str,
        secret: &str,
    ) -> Result<TokenResponse>;

    /// `certificate` is the PEM file content (private key included).
    async fn acquire_token_with_client_certificate(
        &self,
        config: &AuthConfig,
        app_id: &str,
        certificate: &str,
        thumbprint: &str,
    ) -> Result<TokenResponse>;

    async fn acquire_user_code(&self, config: &AuthConfig) -> Result<UserCodeInfo>;

    /// Polls until the user completes the device code login or the code expires.
    async fn acquire_token_with_device_code(
        &self,
        config: &AuthConfig,
        user_code: &UserCodeInfo,
    ) -> Result<TokenResponse>;
}

/// Azure Active Directory OAuth2 client.
#[derive(Clone)]
pub struct AadClient {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    #[serde(default)]
    token_type: Option<String>,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClientAssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    exp: i64,
}

/// v1 endpoints report numbers as strings (`"expires_in": "3599"`).
fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn token_endpoint(config: &AuthConfig) -> String {
    format!("{}/oauth2/token", config.authority_url)
}

impl AadClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(format!("azprofile/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<std::result::Result<Value, OAuthError>> {
        tracing::debug!("POST {}", url);
        let response = self.client.post(url).form(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(Ok(serde_json::from_str(&body)?));
        }

        match serde_json::from_str::<OAuthError>(&body) {
            Ok(err) => Ok(Err(err)),
            Err(_) => Err(AuthError::TokenAcquisitionFailed(format!(
                "{} returned {}: {}",
                url, status, body
            ))),
        }
    }

    async fn request_token(&self, config: &AuthConfig, form: &[(&str, &str)]) -> Result<TokenResponse> {
        match self.post_form(&token_endpoint(config), form).await? {
            Ok(body) => parse_token_response(body, &config.resource_id),
            Err(err) => Err(AuthError::TokenAcquisitionFailed(
                err.error_description.unwrap_or(err.error),
            )),
        }
    }
}

impl Default for AadClient {
    fn default() -> Self {
        Self::new().expect("Failed to create identity client")
    }
}

fn parse_token_response(body: Value, default_resource: &str) -> Result<TokenResponse> {
    let raw: RawTokenResponse = serde_json::from_value(body)?;
    let expires_in = lenient_u64(raw.expires_in.as_ref())
        .map(|s| s as i64)
        .unwrap_or(DEFAULT_EXPIRES_IN);

    // Identity comes from the id_token when present, else from the access token itself.
    let claims = raw
        .id_token
        .as_deref()
        .and_then(|t| jwt::decode_claims(t).ok())
        .or_else(|| jwt::decode_claims(&raw.access_token).ok())
        .unwrap_or_default();

    Ok(TokenResponse {
        token_type: raw.token_type.unwrap_or_else(|| "Bearer".to_string()),
        access_token: raw.access_token,
        refresh_token: raw.refresh_token,
        expires_on: Utc::now() + chrono::Duration::seconds(expires_in),
        resource: raw.resource.unwrap_or_else(|| default_resource.to_string()),
        user_id: claims.user_id(),
        oid: claims.oid.clone(),
    })
}

/// The first `-----BEGIN ... PRIVATE KEY-----` block of a PEM bundle.
fn private_key_block(pem: &str) -> Option<&str> {
    let start = pem.find("-----BEGIN")?;
    let mut offset = start;
    loop {
        let rest = &pem[offset..];
        let header_end = rest.find('\n')?;
        let header = &rest[..header_end];
        if header.contains("PRIVATE KEY") {
            let label = header.trim().trim_start_matches("-----BEGIN ").trim_end_matches("-----");
            let footer = format!("-----END {label}-----");
            let end = rest.find(&footer)? + footer.len();
            return Some(&rest[..end]);
        }
        offset += header_end + pem[offset + header_end..].find("-----BEGIN")?;
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Sign the RS256 client assertion that stands in for a secret in the certificate grant.
fn client_assertion(config: &AuthConfig, app_id: &str, certificate: &str, thumbprint: &str) -> Result<String> {
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

    let key_pem = private_key_block(certificate)
        .ok_or_else(|| AuthError::TokenAcquisitionFailed("certificate file has no private key".into()))?;
    let key = EncodingKey::from_rsa_pem(key_pem.as_bytes())
        .map_err(|e| AuthError::TokenAcquisitionFailed(format!("invalid certificate private key: {e}")))?;
    let thumbprint = decode_hex(thumbprint)
        .ok_or_else(|| AuthError::TokenAcquisitionFailed(format!("invalid thumbprint: {thumbprint}")))?;

    let mut header = Header::new(Algorithm::RS256);
    header.x5t = Some(URL_SAFE_NO_PAD.encode(thumbprint));

    let audience = token_endpoint(config);
    let now = Utc::now().timestamp();
    let claims = ClientAssertionClaims {
        aud: &audience,
        iss: app_id,
        sub: app_id,
        jti: uuid::Uuid::new_v4().to_string(),
        nbf: now,
        exp: now + 600,
    };

    encode(&header, &claims, &key)
        .map_err(|e| AuthError::TokenAcquisitionFailed(format!("failed to sign client assertion: {e}")))
}

#[async_trait]
impl IdentityProvider for AadClient {
    async fn acquire_token_with_username_password(
        &self,
        config: &AuthConfig,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse> {
        self.request_token(
            config,
            &[
                ("grant_type", "password"),
                ("client_id", config.client_id.as_str()),
                ("resource", config.resource_id.as_str()),
                ("username", username),
                ("password", password),
                ("scope", "openid"),
            ],
        )
        .await
    }

    async fn acquire_token_with_refresh_token(
        &self,
        config: &AuthConfig,
        refresh_token: &str,
        resource: &str,
    ) -> Result<TokenResponse> {
        self.request_token(
            config,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", config.client_id.as_str()),
                ("resource", resource),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn acquire_token_with_client_credentials(
        &self,
        config: &AuthConfig,
        app_id: &str,
        secret: &str,
    ) -> Result<TokenResponse> {
        self.request_token(
            config,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", app_id),
                ("client_secret", secret),
                ("resource", config.resource_id.as_str()),
            ],
        )
        .await
    }

    async fn acquire_token_with_client_certificate(
        &self,
        config: &AuthConfig,
        app_id: &str,
        certificate: &str,
        thumbprint: &str,
    ) -> Result<TokenResponse> {
        let assertion = client_assertion(config, app_id, certificate, thumbprint)?;
        self.request_token(
            config,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", app_id),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
                ("resource", config.resource_id.as_str()),
            ],
        )
        .await
    }

    async fn acquire_user_code(&self, config: &AuthConfig) -> Result<UserCodeInfo> {
        let url = format!("{}/oauth2/devicecode", config.authority_url);
        let body = match self
            .post_form(
                &url,
                &[("client_id", config.client_id.as_str()), ("resource", config.resource_id.as_str())],
            )
            .await?
        {
            Ok(body) => body,
            Err(err) => {
                return Err(AuthError::TokenAcquisitionFailed(
                    err.error_description.unwrap_or(err.error),
                ));
            }
        };

        let field = |name: &str| body.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(UserCodeInfo {
            user_code: field("user_code"),
            device_code: field("device_code"),
            verification_url: field("verification_url"),
            expires_in: lenient_u64(body.get("expires_in")).unwrap_or(900),
            interval: lenient_u64(body.get("interval")).unwrap_or(5),
            message: field("message"),
        })
    }

    async fn acquire_token_with_device_code(
        &self,
        config: &AuthConfig,
        user_code: &UserCodeInfo,
    ) -> Result<TokenResponse> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(user_code.expires_in);
        let mut interval = Duration::from_secs(user_code.interval.max(1));
        let url = token_endpoint(config);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() > deadline {
                return Err(AuthError::TokenAcquisitionFailed(
                    "The device code expired before the login was completed".into(),
                ));
            }

            let result = self
                .post_form(
                    &url,
                    &[
                        ("grant_type", "device_code"),
                        ("client_id", config.client_id.as_str()),
                        ("resource", config.resource_id.as_str()),
                        ("code", user_code.device_code.as_str()),
                    ],
                )
                .await?;

            match result {
                Ok(body) => return parse_token_response(body, &config.resource_id),
                Err(err) => match err.error.as_str() {
                    "authorization_pending" => continue,
                    "slow_down" => {
                        interval += Duration::from_secs(5);
                        continue;
                    }
                    _ => {
                        return Err(AuthError::TokenAcquisitionFailed(
                            err.error_description.unwrap_or(err.error),
                        ));
                    }
                },
            }
        }
    }
}
