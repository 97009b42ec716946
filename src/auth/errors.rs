//! # Auth Errors
//!
//! Error taxonomy for every authentication flow. Credential-stage failures
//! are merged into a single variant so responses never reveal whether the
//! account exists; operational states (disabled account, expired token) stay
//! distinct.

use serde::Serialize;
use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication and session errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    /// Unknown email, missing password hash, or wrong password
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Authentication required")]
    AuthRequired,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token is invalid")]
    TokenInvalid,

    #[error("Wrong token type for this operation")]
    WrongTokenType,

    #[error("Token has been revoked")]
    TokenBlacklisted,

    /// Uniform failure for the refresh flow, whatever the underlying cause
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Invalid two-factor code")]
    TwoFactorInvalidCode,

    #[error("Two-factor session has expired")]
    SecondFactorSessionExpired,

    #[error("Two-factor authentication is already enabled")]
    TwoFactorAlreadyEnabled,

    #[error("Two-factor authentication is not enabled")]
    TwoFactorNotEnabled,

    #[error("Email already registered: {0}")]
    EmailExists(String),

    #[error("Username already taken: {0}")]
    UsernameExists(String),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Code exchange with {provider} failed: {reason}")]
    ProviderExchangeFailed { provider: String, reason: String },

    #[error("Profile fetch from {provider} failed: {reason}")]
    ProviderProfileFailed { provider: String, reason: String },

    #[error("No email available from {0}")]
    ProviderEmailMissing(String),

    #[error("No free username variant for: {0}")]
    UsernameExhausted(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidCredentials => 401,
            AuthError::AccountDisabled => 401,
            AuthError::AuthRequired => 401,
            AuthError::TokenExpired => 401,
            AuthError::TokenInvalid => 401,
            AuthError::WrongTokenType => 401,
            AuthError::TokenBlacklisted => 401,
            AuthError::InvalidRefreshToken => 401,
            AuthError::TwoFactorInvalidCode => 400,
            AuthError::SecondFactorSessionExpired => 401,
            AuthError::TwoFactorAlreadyEnabled => 409,
            AuthError::TwoFactorNotEnabled => 400,
            AuthError::EmailExists(_) => 409,
            AuthError::UsernameExists(_) => 409,
            AuthError::UserNotFound(_) => 404,
            AuthError::ProviderExchangeFailed { .. } => 400,
            AuthError::ProviderProfileFailed { .. } => 400,
            AuthError::ProviderEmailMissing(_) => 400,
            AuthError::UsernameExhausted(_) => 409,
            AuthError::Validation(_) => 400,
            AuthError::Internal(_) => 500,
        }
    }

    /// Get stable machine code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "CREDENTIAL_INVALID",
            AuthError::AccountDisabled => "ACCOUNT_DISABLED",
            AuthError::AuthRequired => "AUTH_REQUIRED",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::TokenInvalid => "TOKEN_INVALID",
            AuthError::WrongTokenType => "TOKEN_WRONG_TYPE",
            AuthError::TokenBlacklisted => "TOKEN_BLACKLISTED",
            AuthError::InvalidRefreshToken => "REFRESH_INVALID",
            AuthError::TwoFactorInvalidCode => "SECOND_FACTOR_INVALID",
            AuthError::SecondFactorSessionExpired => "SECOND_FACTOR_SESSION_EXPIRED",
            AuthError::TwoFactorAlreadyEnabled => "SECOND_FACTOR_ALREADY_ENABLED",
            AuthError::TwoFactorNotEnabled => "SECOND_FACTOR_NOT_ENABLED",
            AuthError::EmailExists(_) => "EMAIL_EXISTS",
            AuthError::UsernameExists(_) => "USERNAME_EXISTS",
            AuthError::UserNotFound(_) => "USER_NOT_FOUND",
            AuthError::ProviderExchangeFailed { .. } => "PROVIDER_EXCHANGE_FAILED",
            AuthError::ProviderProfileFailed { .. } => "PROVIDER_PROFILE_FAILED",
            AuthError::ProviderEmailMissing(_) => "PROVIDER_EMAIL_MISSING",
            AuthError::UsernameExhausted(_) => "USERNAME_EXHAUSTED",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::Internal(_) => "INTERNAL_FAULT",
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl From<&AuthError> for ErrorResponse {
    fn from(err: &AuthError) -> Self {
        Self {
            error: err.to_string(),
            code: err.error_code(),
        }
    }
}
