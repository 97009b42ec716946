//! # Federated Provisioning
//!
//! Sign-in through GitHub and Google: exchange the authorization code,
//! fetch the profile, normalize it to a [`ProviderIdentity`], and map that
//! onto a local account keyed by email. Request building and response
//! parsing are pure functions; only [`ProviderGateway`] talks to the
//! network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;

use super::errors::{AuthError, AuthResult};
use super::login::AuthenticatedSession;
use super::tokens::{TokenEngine, TokenKind};
use super::user::{NewUser, User, UserStore};

/// Username collision suffixes tried after the base name (`_1` .. `_10`)
pub const USERNAME_SUFFIX_LIMIT: usize = 10;

/// Outbound timeout for provider calls
const PROVIDER_TIMEOUT: StdDuration = StdDuration::from_secs(10);

// ==================
// Providers
// ==================

/// Supported identity providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    Google,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::GitHub => write!(f, "github"),
            Provider::Google => write!(f, "google"),
        }
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Provider::GitHub),
            "google" => Ok(Provider::Google),
            other => Err(AuthError::Validation(format!(
                "unknown provider: {}",
                other
            ))),
        }
    }
}

/// Credentials registered with a provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Token endpoint for the code exchange
pub fn token_url(provider: Provider) -> &'static str {
    match provider {
        Provider::GitHub => "https://github.com/login/oauth/access_token",
        Provider::Google => "https://oauth2.googleapis.com/token",
    }
}

/// Profile endpoint
pub fn profile_url(provider: Provider) -> &'static str {
    match provider {
        Provider::GitHub => "https://api.github.com/user",
        Provider::Google => "https://www.googleapis.com/oauth2/v3/userinfo",
    }
}

/// GitHub keeps email addresses behind a separate endpoint
pub const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

// ==================
// Wire Formats
// ==================

/// Form body for the code exchange
pub fn build_token_form(settings: &ProviderSettings, code: &str) -> Vec<(&'static str, String)> {
    vec![
        ("client_id", settings.client_id.clone()),
        ("client_secret", settings.client_secret.clone()),
        ("code", code.to_string()),
        ("redirect_uri", settings.redirect_uri.clone()),
        ("grant_type", "authorization_code".to_string()),
    ]
}

/// Extract the provider access token from an exchange response body
///
/// Both providers report failures in-band with an `error` field, GitHub
/// even under HTTP 200, so the body is inspected regardless of status.
pub fn parse_token_response(
    provider: Provider,
    body: &serde_json::Value,
) -> AuthResult<String> {
    if let Some(error) = body.get("error").and_then(|v| v.as_str()) {
        let reason = body
            .get("error_description")
            .and_then(|v| v.as_str())
            .unwrap_or(error);
        return Err(AuthError::ProviderExchangeFailed {
            provider: provider.to_string(),
            reason: reason.to_string(),
        });
    }

    body.get("access_token")
        .and_then(|v| v.as_str())
        .map(|token| token.to_string())
        .ok_or_else(|| AuthError::ProviderExchangeFailed {
            provider: provider.to_string(),
            reason: "response carries no access_token".to_string(),
        })
}

/// GitHub profile response
#[derive(Debug, Deserialize)]
struct GitHubProfile {
    login: String,
    email: Option<String>,
    avatar_url: Option<String>,
}

/// One entry of GitHub's email list
#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// Google userinfo response
#[derive(Debug, Deserialize)]
struct GoogleProfile {
    email: Option<String>,
    picture: Option<String>,
}

// ==================
// Normalized Identity
// ==================

/// What provisioning needs to know about a federated identity
#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub provider: Provider,
    pub email: String,
    /// Provider-suggested username; Google offers none
    pub username_hint: Option<String>,
    pub image: Option<String>,
}

impl ProviderIdentity {
    /// Normalize a GitHub profile, falling back to the email list when the
    /// profile itself hides the address
    pub fn from_github(
        profile: serde_json::Value,
        emails: Option<serde_json::Value>,
    ) -> AuthResult<Self> {
        let profile: GitHubProfile =
            serde_json::from_value(profile).map_err(|e| AuthError::ProviderProfileFailed {
                provider: Provider::GitHub.to_string(),
                reason: format!("unparseable profile: {}", e),
            })?;

        let email = match profile.email {
            Some(email) => Some(email),
            None => emails.and_then(|list| {
                let list: Vec<GitHubEmail> = serde_json::from_value(list).ok()?;
                list.iter()
                    .find(|entry| entry.primary && entry.verified)
                    .or_else(|| list.iter().find(|entry| entry.verified))
                    .map(|entry| entry.email.clone())
            }),
        };

        Ok(Self {
            provider: Provider::GitHub,
            email: email
                .ok_or_else(|| AuthError::ProviderEmailMissing(Provider::GitHub.to_string()))?,
            username_hint: Some(profile.login),
            image: profile.avatar_url,
        })
    }

    /// Normalize a Google userinfo payload
    pub fn from_google(profile: serde_json::Value) -> AuthResult<Self> {
        let profile: GoogleProfile =
            serde_json::from_value(profile).map_err(|e| AuthError::ProviderProfileFailed {
                provider: Provider::Google.to_string(),
                reason: format!("unparseable profile: {}", e),
            })?;

        Ok(Self {
            provider: Provider::Google,
            email: profile
                .email
                .ok_or_else(|| AuthError::ProviderEmailMissing(Provider::Google.to_string()))?,
            username_hint: None,
            image: profile.picture,
        })
    }
}

// ==================
// Provider Gateway
// ==================

/// The network half: exchanges codes and fetches profiles over HTTPS
pub struct ProviderGateway {
    http: reqwest::Client,
    github: Option<ProviderSettings>,
    google: Option<ProviderSettings>,
}

impl ProviderGateway {
    pub fn new(
        github: Option<ProviderSettings>,
        google: Option<ProviderSettings>,
    ) -> AuthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Internal(format!("http client construction failed: {}", e)))?;
        Ok(Self {
            http,
            github,
            google,
        })
    }

    fn settings(&self, provider: Provider) -> AuthResult<&ProviderSettings> {
        let settings = match provider {
            Provider::GitHub => self.github.as_ref(),
            Provider::Google => self.google.as_ref(),
        };
        settings.ok_or_else(|| {
            AuthError::Validation(format!("provider {} is not configured", provider))
        })
    }

    /// Run the full code-to-identity conversation with a provider
    pub async fn fetch_identity(
        &self,
        provider: Provider,
        code: &str,
    ) -> AuthResult<ProviderIdentity> {
        let settings = self.settings(provider)?;
        let provider_token = self.exchange_code(provider, settings, code).await?;
        let profile = self.fetch_json(provider, profile_url(provider), &provider_token).await?;

        match provider {
            Provider::GitHub => {
                // Only hit the email endpoint when the profile hides it
                let emails = if profile.get("email").and_then(|v| v.as_str()).is_none() {
                    Some(
                        self.fetch_json(provider, GITHUB_EMAILS_URL, &provider_token)
                            .await?,
                    )
                } else {
                    None
                };
                ProviderIdentity::from_github(profile, emails)
            }
            Provider::Google => ProviderIdentity::from_google(profile),
        }
    }

    async fn exchange_code(
        &self,
        provider: Provider,
        settings: &ProviderSettings,
        code: &str,
    ) -> AuthResult<String> {
        let response = self
            .http
            .post(token_url(provider))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&build_token_form(settings, code))
            .send()
            .await
            .map_err(|e| AuthError::ProviderExchangeFailed {
                provider: provider.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ProviderExchangeFailed {
                provider: provider.to_string(),
                reason: format!("token endpoint answered {}", status),
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| AuthError::ProviderExchangeFailed {
                    provider: provider.to_string(),
                    reason: format!("unparseable token response: {}", e),
                })?;
        parse_token_response(provider, &body)
    }

    async fn fetch_json(
        &self,
        provider: Provider,
        url: &str,
        provider_token: &str,
    ) -> AuthResult<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(provider_token)
            .header(reqwest::header::ACCEPT, "application/json")
            // GitHub rejects requests without a User-Agent
            .header(reqwest::header::USER_AGENT, "gatehouse")
            .send()
            .await
            .map_err(|e| AuthError::ProviderProfileFailed {
                provider: provider.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ProviderProfileFailed {
                provider: provider.to_string(),
                reason: format!("{} answered {}", url, status),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::ProviderProfileFailed {
                provider: provider.to_string(),
                reason: format!("unparseable body: {}", e),
            })
    }
}

// ==================
// Provisioner
// ==================

/// Maps federated identities onto local accounts and signs them in
pub struct FederatedProvisioner<U: UserStore> {
    users: Arc<U>,
    tokens: Arc<TokenEngine>,
}

impl<U: UserStore> FederatedProvisioner<U> {
    pub fn new(users: Arc<U>, tokens: Arc<TokenEngine>) -> Self {
        Self { users, tokens }
    }

    /// Find or create the account for `identity` and issue both tokens
    pub fn provision_identity(
        &self,
        identity: &ProviderIdentity,
        now: DateTime<Utc>,
    ) -> AuthResult<AuthenticatedSession> {
        let (mut user, created) = self.find_or_create(identity)?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        // Backfill the avatar, never overwrite one the user already has
        if !created && user.image.is_none() && identity.image.is_some() {
            user.image = identity.image.clone();
            user = self.users.update(&user)?;
        }

        info!(
            user_id = user.id,
            provider = %identity.provider,
            created,
            "federated login"
        );

        let access_token = self.tokens.issue(user.id, TokenKind::Access, now)?;
        let refresh_token = self.tokens.issue(user.id, TokenKind::Refresh, now)?;
        Ok(AuthenticatedSession {
            user,
            access_token,
            refresh_token,
        })
    }

    /// Resolve by email, creating the account on first login
    ///
    /// Username collisions walk `base`, `base_1` .. `base_10` in order and
    /// then give up. An email collision means a concurrent first login beat
    /// us to the insert; that login's row wins.
    fn find_or_create(&self, identity: &ProviderIdentity) -> AuthResult<(User, bool)> {
        if let Some(user) = self.users.find_by_email(&identity.email)? {
            return Ok((user, false));
        }

        let base = identity
            .username_hint
            .clone()
            .unwrap_or_else(|| username_from_email(&identity.email));

        for attempt in 0..=USERNAME_SUFFIX_LIMIT {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };

            match self.users.create(NewUser {
                email: identity.email.clone(),
                username: Some(candidate),
                password_hash: None,
                image: identity.image.clone(),
                is_active: true,
            }) {
                Ok(user) => return Ok((user, true)),
                Err(AuthError::UsernameExists(_)) => continue,
                Err(AuthError::EmailExists(_)) => {
                    // A concurrent first login created the row between our
                    // lookup and the insert; use it
                    let user = self.users.find_by_email(&identity.email)?.ok_or_else(|| {
                        AuthError::Internal("user vanished after uniqueness conflict".to_string())
                    })?;
                    return Ok((user, false));
                }
                Err(other) => return Err(other),
            }
        }

        Err(AuthError::UsernameExhausted(base))
    }
}

fn username_from_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, _)) => local.to_string(),
        None => email.to_string(),
    }
}
