//! # Configuration
//!
//! TOML configuration loaded and validated once at startup. Every knob has
//! an explicit default; the only value with no default is the token signing
//! secret, which must come from the file or from `GATEHOUSE_SECRET`.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::auth::oauth::ProviderSettings;
use crate::auth::two_factor::{TotpAlgorithm, TotpConfig};

/// Environment variable that overrides `[auth].secret`
pub const SECRET_ENV: &str = "GATEHOUSE_SECRET";

// ==================
// Errors
// ==================

/// Why a configuration failed to load
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("config file is not valid TOML: {0}")]
    Malformed(String),

    #[error("invalid configuration:\n{}", format_field_errors(.0))]
    Rejected(Vec<FieldError>),
}

/// One rejected configuration value
#[derive(Debug)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}': {}", self.field, self.message)
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

// ==================
// Structure
// ==================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Browser origins allowed to send credentialed requests
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for token signing; `GATEHOUSE_SECRET` wins over the file
    #[serde(default)]
    pub secret: String,

    /// Access token lifetime in seconds (default: 1 hour)
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,

    /// Refresh token lifetime in seconds (default: 24 hours)
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,

    /// How long a password-verified login may wait for its second factor
    #[serde(default = "default_pending_ttl")]
    pub pending_second_factor_ttl_secs: i64,

    /// How long unconfirmed two-factor setup material is kept
    #[serde(default = "default_setup_ttl")]
    pub setup_stash_ttl_secs: i64,

    /// Issuer label shown in authenticator apps
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Mark session cookies `Secure` (default: false, for plain-HTTP dev)
    #[serde(default)]
    pub cookie_secure: bool,

    #[serde(default)]
    pub totp: TotpSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TotpSettings {
    #[serde(default = "default_totp_digits")]
    pub digits: u32,

    #[serde(default = "default_totp_period")]
    pub period: u64,

    #[serde(default = "default_totp_skew")]
    pub skew: u32,

    /// One of SHA1, SHA256, SHA512 (default: SHA1)
    #[serde(default = "default_totp_algorithm")]
    pub algorithm: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub github: Option<ProviderSettings>,

    #[serde(default)]
    pub google: Option<ProviderSettings>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}
fn default_access_ttl() -> i64 {
    3600
} // 1 hour
fn default_refresh_ttl() -> i64 {
    86400
} // 24 hours
fn default_pending_ttl() -> i64 {
    300
} // 5 minutes
fn default_setup_ttl() -> i64 {
    600
} // 10 minutes
fn default_issuer() -> String {
    "Gatehouse".to_string()
}
fn default_totp_digits() -> u32 {
    6
}
fn default_totp_period() -> u64 {
    30
}
fn default_totp_skew() -> u32 {
    1
}
fn default_totp_algorithm() -> String {
    "SHA1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            pending_second_factor_ttl_secs: default_pending_ttl(),
            setup_stash_ttl_secs: default_setup_ttl(),
            issuer: default_issuer(),
            cookie_secure: false,
            totp: TotpSettings::default(),
        }
    }
}

impl Default for TotpSettings {
    fn default() -> Self {
        Self {
            digits: default_totp_digits(),
            period: default_totp_period(),
            skew: default_totp_skew(),
            algorithm: default_totp_algorithm(),
        }
    }
}

// ==================
// Loading
// ==================

impl Config {
    /// Load configuration from file, apply the env override, validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let secret_override = std::env::var(SECRET_ENV).ok().filter(|s| !s.is_empty());
        Self::load_with_override(path, secret_override)
    }

    fn load_with_override(
        path: &Path,
        secret_override: Option<String>,
    ) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        if let Some(secret) = secret_override {
            config.auth.secret = secret;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every field, collecting all rejections at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            reject(&mut errors, "server.port", "port must be between 1 and 65535");
        }
        for origin in &self.server.cors_origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                reject(
                    &mut errors,
                    "server.cors_origins",
                    &format!("'{}' must start with http:// or https://", origin),
                );
            }
        }

        if self.auth.secret.trim().is_empty() {
            reject(
                &mut errors,
                "auth.secret",
                &format!("signing secret cannot be empty (set it or export {})", SECRET_ENV),
            );
        }
        if self.auth.access_token_ttl_secs <= 0 {
            reject(&mut errors, "auth.access_token_ttl_secs", "value must be positive");
        }
        if self.auth.refresh_token_ttl_secs <= 0 {
            reject(&mut errors, "auth.refresh_token_ttl_secs", "value must be positive");
        }
        if self.auth.pending_second_factor_ttl_secs <= 0 {
            reject(
                &mut errors,
                "auth.pending_second_factor_ttl_secs",
                "value must be positive",
            );
        }
        if self.auth.setup_stash_ttl_secs <= 0 {
            reject(&mut errors, "auth.setup_stash_ttl_secs", "value must be positive");
        }
        if self.auth.issuer.trim().is_empty() {
            reject(&mut errors, "auth.issuer", "value cannot be empty");
        }

        if !(6..=8).contains(&self.auth.totp.digits) {
            reject(&mut errors, "auth.totp.digits", "value must be between 6 and 8");
        }
        if self.auth.totp.period == 0 {
            reject(&mut errors, "auth.totp.period", "value must be positive");
        }
        if TotpAlgorithm::from_str(&self.auth.totp.algorithm).is_err() {
            reject(
                &mut errors,
                "auth.totp.algorithm",
                "value must be one of SHA1, SHA256, SHA512",
            );
        }

        if let Some(settings) = &self.providers.github {
            validate_provider(&mut errors, "providers.github", settings);
        }
        if let Some(settings) = &self.providers.google {
            validate_provider(&mut errors, "providers.google", settings);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Rejected(errors))
        }
    }

    /// TOTP parameters in engine form
    pub fn totp_config(&self) -> TotpConfig {
        TotpConfig {
            issuer: self.auth.issuer.clone(),
            digits: self.auth.totp.digits,
            period: self.auth.totp.period,
            algorithm: TotpAlgorithm::from_str(&self.auth.totp.algorithm)
                .unwrap_or(TotpAlgorithm::SHA1),
            skew: self.auth.totp.skew,
        }
    }

    pub fn access_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.access_token_ttl_secs)
    }

    pub fn refresh_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.refresh_token_ttl_secs)
    }

    pub fn pending_second_factor_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.pending_second_factor_ttl_secs)
    }

    pub fn setup_stash_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.setup_stash_ttl_secs)
    }
}

fn reject(errors: &mut Vec<FieldError>, field: &str, message: &str) {
    errors.push(FieldError {
        field: field.to_string(),
        message: message.to_string(),
    });
}

fn validate_provider(errors: &mut Vec<FieldError>, field: &str, settings: &ProviderSettings) {
    if settings.client_id.trim().is_empty() {
        reject(errors, &format!("{}.client_id", field), "value cannot be empty");
    }
    if settings.client_secret.trim().is_empty() {
        reject(errors, &format!("{}.client_secret", field), "value cannot be empty");
    }
    if !settings.redirect_uri.starts_with("http://")
        && !settings.redirect_uri.starts_with("https://")
    {
        reject(
            errors,
            &format!("{}.redirect_uri", field),
            "value must start with http:// or https://",
        );
    }
}
