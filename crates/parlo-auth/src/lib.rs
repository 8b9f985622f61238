//! Bearer-token issuance and verification.
//!
//! Tokens are signed with a pre-shared symmetric secret:
//! `base64url(claims JSON) . base64url(HMAC-SHA256(secret, claims))`.
//! Verification checks the signature first, then expiry, in constant time
//! for the signature comparison.
//!
//! Refresh-token mechanics live in the HTTP signup/login service; this crate
//! only carries the configured lifetimes and validates what arrives on the
//! datagram path.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,
}

/// Verified token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: Uuid,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    sub: Uuid,
    name: String,
    iat: i64,
    exp: i64,
}

/// Issues and validates access tokens against a shared secret.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Issue an access token for `user_id` valid for the configured TTL.
    pub fn issue(&self, user_id: Uuid, username: &str) -> String {
        let now = Utc::now();
        self.issue_at(user_id, username, now, now + self.access_ttl)
    }

    /// Issue a token with explicit timestamps. Exposed for expiry tests.
    pub fn issue_at(
        &self,
        user_id: Uuid,
        username: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> String {
        let claims = RawClaims {
            sub: user_id,
            name: username.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        // RawClaims has no non-serialisable fields, so this cannot fail.
        let body = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let tag = self.sign(encoded.as_bytes());
        format!("{}.{}", encoded, URL_SAFE_NO_PAD.encode(tag))
    }

    /// Validate a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (body, tag) = token.split_once('.').ok_or(AuthError::Malformed)?;

        let tag_bytes = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Malformed)?;
        mac.update(body.as_bytes());
        mac.verify_slice(&tag_bytes)
            .map_err(|_| AuthError::InvalidSignature)?;

        let body_bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| AuthError::Malformed)?;
        let raw: RawClaims =
            serde_json::from_slice(&body_bytes).map_err(|_| AuthError::Malformed)?;

        let expires_at = Utc
            .timestamp_opt(raw.exp, 0)
            .single()
            .ok_or(AuthError::Malformed)?;
        if Utc::now() > expires_at {
            return Err(AuthError::Expired);
        }

        Ok(Claims {
            user_id: raw.sub,
            username: raw.name,
            expires_at,
        })
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(secret: &str) -> TokenService {
        TokenService::new(secret, Duration::minutes(15), Duration::days(7))
    }

    #[test]
    fn issue_and_verify() {
        let svc = service("correct horse battery staple");
        let user = Uuid::new_v4();

        let token = svc.issue(user, "ada");
        let claims = svc.verify(&token).unwrap();

        assert_eq!(claims.user_id, user);
        assert_eq!(claims.username, "ada");
        assert!(claims.expires_at > Utc::now());
    }

    #[test]
    fn expired_token_rejected() {
        let svc = service("secret");
        let token = svc.issue_at(
            Uuid::new_v4(),
            "ada",
            Utc::now() - Duration::hours(2),
            Utc::now() - Duration::hours(1),
        );

        assert_eq!(svc.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = service("secret-a").issue(Uuid::new_v4(), "ada");
        assert_eq!(
            service("secret-b").verify(&token),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_body_rejected() {
        let svc = service("secret");
        let token = svc.issue(Uuid::new_v4(), "ada");

        // Swap one character inside the claims part.
        let mut chars: Vec<char> = token.chars().collect();
        chars[3] = if chars[3] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert!(matches!(
            svc.verify(&tampered),
            Err(AuthError::InvalidSignature) | Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn garbage_rejected_as_malformed() {
        let svc = service("secret");
        assert_eq!(svc.verify("not a token"), Err(AuthError::Malformed));
        assert_eq!(svc.verify(""), Err(AuthError::Malformed));
        assert_eq!(svc.verify("a.b.c"), Err(AuthError::Malformed));
    }
}
