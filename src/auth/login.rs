//! # Login Flow
//!
//! The state machine behind every sign-in: password check, optional
//! second-factor challenge, token issuance, logout, refresh, and the
//! access-token check the rest of the application authenticates with.
//!
//! The flow holds no per-request state. The only thing that survives
//! between the password stage and the second-factor stage is a marker in
//! the ephemeral store, bounded by a short window.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use super::crypto;
use super::ephemeral::{keys, EphemeralStore};
use super::errors::{AuthError, AuthResult};
use super::tokens::{TokenEngine, TokenKind};
use super::two_factor::TwoFactorEngine;
use super::user::{User, UserStore};

// ==================
// Outcomes
// ==================

/// A fully signed-in user with both session tokens
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of the password stage
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// No second factor configured; login is complete
    Authenticated(AuthenticatedSession),
    /// Password accepted; a second-factor code must follow within the window
    SecondFactorRequired { user_id: i64 },
}

// ==================
// Login Flow
// ==================

/// Orchestrates the multi-step login protocol
pub struct LoginFlow<U: UserStore, E: EphemeralStore> {
    users: Arc<U>,
    ephemeral: Arc<E>,
    tokens: Arc<TokenEngine>,
    two_factor: TwoFactorEngine<U>,
    pending_ttl: Duration,
}

impl<U: UserStore, E: EphemeralStore> LoginFlow<U, E> {
    pub fn new(
        users: Arc<U>,
        ephemeral: Arc<E>,
        tokens: Arc<TokenEngine>,
        two_factor: TwoFactorEngine<U>,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            users,
            ephemeral,
            tokens,
            two_factor,
            pending_ttl,
        }
    }

    fn issue_session(&self, user: User, now: DateTime<Utc>) -> AuthResult<AuthenticatedSession> {
        let access_token = self.tokens.issue(user.id, TokenKind::Access, now)?;
        let refresh_token = self.tokens.issue(user.id, TokenKind::Refresh, now)?;
        Ok(AuthenticatedSession {
            user,
            access_token,
            refresh_token,
        })
    }

    /// Password stage
    ///
    /// Unknown email, an account with no password, and a wrong password are
    /// indistinguishable to the caller. A disabled account is reported as
    /// such, but only after the password checked out.
    pub fn submit(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<LoginOutcome> {
        let user = self
            .users
            .find_by_email(email)?
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        if !crypto::verify_password(password, hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        if user.two_factor_enabled {
            self.ephemeral.set(
                &keys::second_factor_pending(user.id),
                "pending",
                self.pending_ttl,
                now,
            )?;
            info!(user_id = user.id, "password accepted, second factor required");
            return Ok(LoginOutcome::SecondFactorRequired { user_id: user.id });
        }

        info!(user_id = user.id, "login successful");
        Ok(LoginOutcome::Authenticated(self.issue_session(user, now)?))
    }

    /// Second-factor stage
    ///
    /// Requires a live pending marker, which only the password stage writes;
    /// without one the attempt is rejected no matter how good the code is.
    /// A failed code leaves the marker's deadline untouched.
    pub fn submit_second_factor(
        &self,
        user_id: i64,
        code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<AuthenticatedSession> {
        let pending_key = keys::second_factor_pending(user_id);
        if self.ephemeral.get(&pending_key, now)?.is_none() {
            return Err(AuthError::SecondFactorSessionExpired);
        }

        let user = self
            .two_factor
            .verify_factor(user_id, code, now)
            .map_err(|err| match err {
                // Do not confirm or deny the account's existence here
                AuthError::UserNotFound(_) => AuthError::SecondFactorSessionExpired,
                other => other,
            })?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        self.ephemeral.remove(&pending_key, now)?;
        info!(user_id = user.id, "second factor accepted, login successful");
        self.issue_session(user, now)
    }

    /// Revoke whichever presented tokens are still live
    ///
    /// Idempotent: expired, malformed, missing, and already-revoked tokens
    /// all leave logout successful.
    pub fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        for token in [access_token, refresh_token].into_iter().flatten() {
            self.blacklist_if_live(token, now)?;
        }
        Ok(())
    }

    fn blacklist_if_live(&self, token: &str, now: DateTime<Utc>) -> AuthResult<()> {
        let claims = match self.tokens.verify(token, now) {
            Ok(claims) => claims,
            // Nothing left to revoke
            Err(_) => return Ok(()),
        };

        let key = keys::blacklist(token);
        if self.ephemeral.get(&key, now)?.is_none() {
            // The entry only needs to outlive the token itself
            self.ephemeral
                .set(&key, "revoked", claims.remaining(now), now)?;
            info!(user_id = claims.user_id, kind = %claims.kind, "token revoked");
        }
        Ok(())
    }

    /// Exchange a live refresh token for a new access token
    ///
    /// Every failure collapses to the same error: expired, malformed, wrong
    /// type, revoked, and unresolvable subject all look identical. The
    /// refresh token itself is not rotated.
    pub fn refresh(&self, refresh_token: &str, now: DateTime<Utc>) -> AuthResult<(User, String)> {
        self.check_refresh(refresh_token, now).map_err(|err| match err {
            AuthError::Internal(msg) => AuthError::Internal(msg),
            _ => AuthError::InvalidRefreshToken,
        })
    }

    fn check_refresh(&self, refresh_token: &str, now: DateTime<Utc>) -> AuthResult<(User, String)> {
        if self
            .ephemeral
            .get(&keys::blacklist(refresh_token), now)?
            .is_some()
        {
            return Err(AuthError::TokenBlacklisted);
        }

        let claims = self
            .tokens
            .verify_kind(refresh_token, TokenKind::Refresh, now)?;
        let user = self
            .users
            .find_by_id(claims.user_id)?
            .ok_or(AuthError::TokenInvalid)?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        let access_token = self.tokens.issue(user.id, TokenKind::Access, now)?;
        Ok((user, access_token))
    }

    /// Resolve an access token to its user
    ///
    /// The blacklist is consulted before the signature, so a revoked token
    /// is reported as revoked even once it has also expired.
    pub fn authenticate(&self, access_token: &str, now: DateTime<Utc>) -> AuthResult<User> {
        if self
            .ephemeral
            .get(&keys::blacklist(access_token), now)?
            .is_some()
        {
            return Err(AuthError::TokenBlacklisted);
        }

        let claims = self.tokens.verify_kind(access_token, TokenKind::Access, now)?;
        let user = self
            .users
            .find_by_id(claims.user_id)?
            .ok_or(AuthError::TokenInvalid)?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        Ok(user)
    }
}
