//! # Session Tokens
//!
//! Signed, self-contained session tokens (JWT, HS256). Issuance and
//! verification are pure: the clock is a parameter, nothing is persisted,
//! and revocation is layered on top by callers through the blacklist.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::errors::{AuthError, AuthResult};

// ==================
// Claims
// ==================

/// Discriminates access tokens from refresh tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// Payload carried by every session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: i64,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub kind: TokenKind,
}

impl TokenClaims {
    /// Time left until this token expires; negative once past `exp`
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        Duration::seconds(self.exp - now.timestamp())
    }
}

// ==================
// Token Engine
// ==================

/// Issues and verifies session tokens with a single process-wide secret
pub struct TokenEngine {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl TokenEngine {
    pub fn new(secret: &str, access_lifetime: Duration, refresh_lifetime: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_lifetime,
            refresh_lifetime,
        }
    }

    pub fn lifetime(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_lifetime,
            TokenKind::Refresh => self.refresh_lifetime,
        }
    }

    /// Issue a signed token for `user_id`, valid from `now`
    pub fn issue(&self, user_id: i64, kind: TokenKind, now: DateTime<Utc>) -> AuthResult<String> {
        let claims = TokenClaims {
            user_id,
            iat: now.timestamp(),
            exp: (now + self.lifetime(kind)).timestamp(),
            kind,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("token signing failed: {}", e)))
    }

    /// Verify signature and structure, then check expiry against `now`
    ///
    /// Expiry is checked here rather than by the JWT library so there is no
    /// hidden leeway and no second clock: a token is rejected the moment
    /// `exp <= now`. Revocation is NOT checked here.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> AuthResult<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        let data = decode::<TokenClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid,
            }
        })?;

        if data.claims.exp <= now.timestamp() {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    /// Verify and additionally require the token to be of `kind`
    pub fn verify_kind(
        &self,
        token: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> AuthResult<TokenClaims> {
        let claims = self.verify(token, now)?;
        if claims.kind != kind {
            return Err(AuthError::WrongTokenType);
        }
        Ok(claims)
    }
}
