//! Identity decoded from the bearer token handed to the client.
//!
//! Claims are read, not verified. The client trusts the signature applied by
//! the issuing service and performs no cryptographic check of its own; the
//! server remains the only party that authenticates requests.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::domain::UserId;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    id: Option<UserId>,
    #[serde(default)]
    sub: Option<UserId>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    token: Option<String>,
    user_id: Option<UserId>,
    username: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session without identity: receive-only.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn decode(token: Option<&str>) -> Self {
        Self::decode_at(token, Utc::now())
    }

    /// Never fails: a missing, malformed or expired token yields [`Session::empty`].
    pub fn decode_at(token: Option<&str>, now: DateTime<Utc>) -> Self {
        let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) else {
            return Self::empty();
        };

        let claims = match read_claims(token) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(error = %err, "session: malformed token, continuing without identity");
                return Self::empty();
            }
        };

        let expires_at = match claims.exp {
            Some(exp) => match Utc.timestamp_opt(exp, 0).single() {
                Some(at) => Some(at),
                None => {
                    warn!(exp, "session: token expiry out of range");
                    return Self::empty();
                }
            },
            None => None,
        };
        if let Some(at) = expires_at {
            if at <= now {
                warn!(expired_at = %at, "session: token expired, continuing without identity");
                return Self::empty();
            }
        }

        Self {
            token: Some(token.to_string()),
            user_id: claims
                .id
                .or(claims.sub)
                .filter(|id| !id.as_str().trim().is_empty()),
            username: claims.username,
            expires_at,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn can_send(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_none()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn read_claims(token: &str) -> jsonwebtoken::errors::Result<TokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
