//! # Two-Factor Authentication
//!
//! TOTP second factor (RFC 6238) with one-use backup codes. Setup runs in
//! two steps: `begin_setup` hands out unconfirmed material, `confirm_setup`
//! proves the authenticator works before anything touches the user record.
//! During verification the backup-code set is consulted first, so a matched
//! code is consumed exactly once; TOTP is only tried when no backup code
//! matched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use super::crypto;
use super::errors::{AuthError, AuthResult};
use super::user::{User, UserStore};

/// Backup codes issued per setup
pub const BACKUP_CODE_COUNT: usize = 8;
/// Entropy per backup code, before hex encoding
pub const BACKUP_CODE_BYTES: usize = 8;

// ==================
// TOTP Configuration
// ==================

/// TOTP parameters
#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// Issuer name (shown in authenticator apps)
    pub issuer: String,
    /// Number of digits (default: 6)
    pub digits: u32,
    /// Time step in seconds (default: 30)
    pub period: u64,
    /// Algorithm (default: SHA1 for authenticator compatibility)
    pub algorithm: TotpAlgorithm,
    /// Number of periods accepted before/after the current one (default: 1)
    pub skew: u32,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "Gatehouse".to_string(),
            digits: 6,
            period: 30,
            algorithm: TotpAlgorithm::SHA1,
            skew: 1,
        }
    }
}

/// TOTP hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotpAlgorithm {
    SHA1,
    SHA256,
    SHA512,
}

impl std::fmt::Display for TotpAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TotpAlgorithm::SHA1 => write!(f, "SHA1"),
            TotpAlgorithm::SHA256 => write!(f, "SHA256"),
            TotpAlgorithm::SHA512 => write!(f, "SHA512"),
        }
    }
}

impl FromStr for TotpAlgorithm {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(TotpAlgorithm::SHA1),
            "SHA256" => Ok(TotpAlgorithm::SHA256),
            "SHA512" => Ok(TotpAlgorithm::SHA512),
            other => Err(AuthError::Validation(format!(
                "unknown TOTP algorithm: {}",
                other
            ))),
        }
    }
}

// ==================
// TOTP Implementation
// ==================

fn unix_time(now: DateTime<Utc>) -> u64 {
    now.timestamp().max(0) as u64
}

/// Generate the TOTP code for a given unix timestamp
pub fn generate_totp(secret: &str, timestamp: u64, config: &TotpConfig) -> AuthResult<String> {
    let secret_bytes = crypto::base32_decode(secret)
        .ok_or_else(|| AuthError::Internal("malformed TOTP secret".to_string()))?;

    let counter = timestamp / config.period;
    let counter_bytes = counter.to_be_bytes();

    let hash = compute_hmac(&secret_bytes, &counter_bytes, config.algorithm);

    // Dynamic truncation (RFC 4226)
    let offset = (hash[hash.len() - 1] & 0x0F) as usize;
    let binary = ((hash[offset] & 0x7F) as u32) << 24
        | (hash[offset + 1] as u32) << 16
        | (hash[offset + 2] as u32) << 8
        | (hash[offset + 3] as u32);

    let otp = binary % 10u32.pow(config.digits);
    Ok(format!("{:0>width$}", otp, width = config.digits as usize))
}

fn compute_hmac(key: &[u8], data: &[u8], algorithm: TotpAlgorithm) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;
    use sha2::{Sha256, Sha512};

    match algorithm {
        TotpAlgorithm::SHA1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC can accept any key size");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::SHA256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC can accept any key size");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::SHA512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).expect("HMAC can accept any key size");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Verify a TOTP code at `timestamp`, accepting `skew` adjacent periods
pub fn verify_totp(
    secret: &str,
    code: &str,
    timestamp: u64,
    config: &TotpConfig,
) -> AuthResult<bool> {
    for offset in 0..=config.skew {
        let ts = timestamp + (offset as u64 * config.period);
        if crypto::constant_time_eq(&generate_totp(secret, ts, config)?, code) {
            return Ok(true);
        }

        // offset 0 already checked above
        if offset > 0 {
            let ts = timestamp.saturating_sub(offset as u64 * config.period);
            if crypto::constant_time_eq(&generate_totp(secret, ts, config)?, code) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Generate the otpauth:// URI an authenticator app enrolls from
pub fn generate_provisioning_uri(secret: &str, account: &str, config: &TotpConfig) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm={}&digits={}&period={}",
        urlencoding::encode(&config.issuer),
        urlencoding::encode(account),
        secret,
        urlencoding::encode(&config.issuer),
        config.algorithm,
        config.digits,
        config.period
    )
}

// ==================
// Backup Codes
// ==================

/// Generate one-use backup codes (hex encoded)
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    (0..count)
        .map(|_| crypto::random_hex(BACKUP_CODE_BYTES))
        .collect()
}

// ==================
// Pending Setup
// ==================

/// Material handed out by `begin_setup`, not yet written to the user record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSetup {
    pub secret: String,
    pub backup_codes: Vec<String>,
    pub provisioning_uri: String,
}

// ==================
// Two-Factor Engine
// ==================

/// Drives the second-factor lifecycle against the user store
pub struct TwoFactorEngine<U: UserStore> {
    users: Arc<U>,
    config: TotpConfig,
}

impl<U: UserStore> Clone for TwoFactorEngine<U> {
    fn clone(&self) -> Self {
        Self {
            users: Arc::clone(&self.users),
            config: self.config.clone(),
        }
    }
}

impl<U: UserStore> TwoFactorEngine<U> {
    pub fn new(users: Arc<U>, config: TotpConfig) -> Self {
        Self { users, config }
    }

    fn load(&self, user_id: i64) -> AuthResult<User> {
        self.users
            .find_by_id(user_id)?
            .ok_or(AuthError::UserNotFound(user_id))
    }

    /// Start setup: generate a secret, backup codes, and the enrollment URI
    ///
    /// Nothing is persisted; the caller holds the [`PendingSetup`] until the
    /// user proves their authenticator with `confirm_setup`.
    pub fn begin_setup(&self, user_id: i64) -> AuthResult<PendingSetup> {
        let user = self.load(user_id)?;
        if user.two_factor_enabled {
            return Err(AuthError::TwoFactorAlreadyEnabled);
        }

        let secret = crypto::generate_totp_secret();
        let provisioning_uri = generate_provisioning_uri(&secret, &user.email, &self.config);
        Ok(PendingSetup {
            secret,
            backup_codes: generate_backup_codes(BACKUP_CODE_COUNT),
            provisioning_uri,
        })
    }

    /// Verify a code against pending material and enable the second factor
    ///
    /// On a wrong code the pending material stays valid, so the user can
    /// retry without rescanning.
    pub fn confirm_setup(
        &self,
        user_id: i64,
        pending: &PendingSetup,
        code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<User> {
        if !verify_totp(&pending.secret, code, unix_time(now), &self.config)? {
            return Err(AuthError::TwoFactorInvalidCode);
        }

        let mut user = self.load(user_id)?;
        if user.two_factor_enabled {
            return Err(AuthError::TwoFactorAlreadyEnabled);
        }

        user.two_factor_enabled = true;
        user.totp_secret = Some(pending.secret.clone());
        user.backup_codes = pending.backup_codes.clone();
        self.users.update(&user)
    }

    /// Verify a submitted second-factor value
    ///
    /// Backup codes are checked first; a match consumes the code and skips
    /// TOTP entirely. Returns the user as stored after any consumption.
    pub fn verify_factor(&self, user_id: i64, code: &str, now: DateTime<Utc>) -> AuthResult<User> {
        let mut user = self.load(user_id)?;
        if !user.two_factor_enabled {
            return Err(AuthError::TwoFactorNotEnabled);
        }

        if let Some(index) = user
            .backup_codes
            .iter()
            .position(|candidate| crypto::constant_time_eq(candidate, code))
        {
            user.backup_codes.remove(index);
            return self.users.update(&user);
        }

        let secret = user
            .totp_secret
            .as_deref()
            .ok_or_else(|| AuthError::Internal("two-factor enabled without a secret".to_string()))?;
        if verify_totp(secret, code, unix_time(now), &self.config)? {
            Ok(user)
        } else {
            Err(AuthError::TwoFactorInvalidCode)
        }
    }

    /// Turn the second factor off
    ///
    /// Requires a live TOTP code; backup codes are not accepted here.
    pub fn disable(&self, user_id: i64, code: &str, now: DateTime<Utc>) -> AuthResult<User> {
        let mut user = self.load(user_id)?;
        if !user.two_factor_enabled {
            return Err(AuthError::TwoFactorNotEnabled);
        }

        let secret = user
            .totp_secret
            .as_deref()
            .ok_or_else(|| AuthError::Internal("two-factor enabled without a secret".to_string()))?;
        if !verify_totp(secret, code, unix_time(now), &self.config)? {
            return Err(AuthError::TwoFactorInvalidCode);
        }

        user.two_factor_enabled = false;
        user.totp_secret = None;
        user.backup_codes = Vec::new();
        self.users.update(&user)
    }
}
