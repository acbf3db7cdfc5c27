//! JWT credential verification.
//!
//! Tokens are HS256-signed with claims `{username, sub, exp}`. They are read
//! from the `token` query parameter (WebSocket upgrades) or an
//! `Authorization: Bearer` header.

use axum::http::{header, HeaderMap};
use courier_core::{AuthError, Identity, Verifier};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub sub: String,
    /// Expiry (Unix timestamp).
    pub exp: i64,
}

impl Claims {
    fn identity(self) -> Option<Identity> {
        if !self.username.is_empty() {
            Some(self.username)
        } else if !self.sub.is_empty() {
            Some(self.sub)
        } else {
            None
        }
    }
}

/// [`Verifier`] backed by a shared HS256 secret. Tokens are minted by the
/// account service, never here.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl Verifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        data.claims
            .identity()
            .ok_or_else(|| AuthError::Invalid("token names no user".into()))
    }
}

/// Pick the credential from the query string or the `Authorization` header.
#[must_use]
pub fn extract_token<'a>(query_token: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(token) = query_token.filter(|t| !t.trim().is_empty()) {
        return Some(token);
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Sign `claims` with `secret`, the way the account service does.
#[cfg(test)]
pub(crate) fn sign(secret: &str, claims: &Claims) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// A token for `username` valid for `ttl_secs`.
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, username: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        username: username.to_string(),
        sub: username.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    sign(secret, &claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_issue_and_verify() {
        let verifier = JwtVerifier::new("secret", 0);
        let token = issue_token("secret", "alice", 3600);
        assert_eq!(verifier.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = issue_token("secret", "alice", 3600);
        let other = JwtVerifier::new("other", 0);
        assert!(matches!(other.verify(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn test_expired_token() {
        let verifier = JwtVerifier::new("secret", 0);
        let token = issue_token("secret", "alice", -120);
        assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_sub_fallback() {
        let verifier = JwtVerifier::new("secret", 0);
        let claims = Claims {
            username: String::new(),
            sub: "bob".into(),
            exp: chrono::Utc::now().timestamp() + 60,
        };
        assert_eq!(verifier.verify(&sign("secret", &claims)).unwrap(), "bob");
    }

    #[test]
    fn test_empty_token() {
        let verifier = JwtVerifier::new("secret", 0);
        assert_eq!(verifier.verify("  "), Err(AuthError::Missing));
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(None, &headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(None, &headers), Some("abc"));
        assert_eq!(extract_token(Some("xyz"), &headers), Some("xyz"));
        assert_eq!(extract_token(Some(""), &headers), Some("abc"));
    }
}
