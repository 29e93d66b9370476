//! Unverified JWT claim decoding.
//!
//! Tokens handed to us by the identity provider (or by the cloud console) are only
//! inspected for identity claims; signature validation is the resource's job.

use crate::error::{AuthError, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub unique_name: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// `unique_name` with any identity-provider prefix (`live.com#user@x`) stripped.
    pub fn unique_user(&self) -> Option<&str> {
        let name = self.unique_name.as_deref()?;
        let mut parts = name.split('#');
        let first = parts.next()?;
        Some(parts.next().filter(|s| !s.is_empty()).unwrap_or(first))
    }

    /// The user id the identity provider would report for this token.
    pub fn user_id(&self) -> Option<String> {
        self.upn
            .as_deref()
            .or(self.email.as_deref())
            .or_else(|| self.unique_user())
            .or(self.sub.as_deref())
            .map(str::to_string)
    }
}

/// Decode the payload segment of a compact JWT without checking its signature.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_header), Some(payload)) if !payload.is_empty() => payload,
        _ => return Err(AuthError::InvalidToken("expected a header.payload.signature token".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidToken(format!("payload is not base64url: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidToken(format!("payload is not a JSON claim set: {e}")))
}

#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_claims() {
        let token = encode_unsigned(&json!({
            "tid": "tenant-1",
            "aud": "https://management.core.windows.net/",
            "unique_name": "live.com#someone@outlook.com",
            "oid": "object-1"
        }));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.tid.as_deref(), Some("tenant-1"));
        assert_eq!(claims.unique_user(), Some("someone@outlook.com"));
        assert_eq!(claims.user_id().as_deref(), Some("someone@outlook.com"));
    }

    #[test]
    fn test_upn_wins_over_unique_name() {
        let token = encode_unsigned(&json!({
            "upn": "admin@contoso.com",
            "unique_name": "other@contoso.com"
        }));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.user_id().as_deref(), Some("admin@contoso.com"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_claims("not-a-token"), Err(AuthError::InvalidToken(_))));
        assert!(matches!(decode_claims("a.!!!.c"), Err(AuthError::InvalidToken(_))));
    }
}
