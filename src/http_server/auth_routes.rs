//! # Auth Routes
//!
//! Handlers for registration, login, the second-factor lifecycle, token
//! refresh, logout, and federated sign-in. Session tokens travel in cookies
//! only; every handler resolves its own clock once at entry.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::crypto;
use crate::auth::ephemeral::{keys, EphemeralStore};
use crate::auth::errors::{AuthError, AuthResult};
use crate::auth::login::{AuthenticatedSession, LoginOutcome};
use crate::auth::oauth::Provider;
use crate::auth::two_factor::PendingSetup;
use crate::auth::user::{NewUser, User, UserProfile, UserStore};

use super::cookies::{self, SameSite, ACCESS_COOKIE, LOGGED_IN_COOKIE, REFRESH_COOKIE};
use super::AppState;

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub password2: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SecondFactorRequest {
    pub user_id: i64,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub message: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub requires_2fa: bool,
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub secret: String,
    /// otpauth:// URI for the frontend to render as a QR code
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SetupConfirmedResponse {
    pub message: String,
    pub backup_codes: Vec<String>,
}

// ==================
// Helpers
// ==================

/// Resolve the signed-in user from the access cookie
fn cookie_user(state: &AppState, headers: &HeaderMap, now: DateTime<Utc>) -> AuthResult<User> {
    let token = cookies::read_cookie(headers, ACCESS_COOKIE).ok_or(AuthError::AuthRequired)?;
    state.login.authenticate(&token, now)
}

fn cookie_header(
    state: &AppState,
    name: &str,
    value: &str,
    max_age_secs: i64,
    http_only: bool,
    same_site: SameSite,
) -> AuthResult<HeaderValue> {
    cookies::set_cookie(name, value, max_age_secs, http_only, same_site, state.cookie_secure)
        .map_err(|e| AuthError::Internal(format!("cookie header: {}", e)))
}

/// 200 response carrying the profile and all three session cookies
fn signed_in_response(
    state: &AppState,
    session: AuthenticatedSession,
    same_site: SameSite,
) -> Result<Response, AuthError> {
    let mut response = Json(SessionResponse {
        message: "Login successful".to_string(),
        user: session.user.profile(),
    })
    .into_response();

    let headers = response.headers_mut();
    headers.append(
        SET_COOKIE,
        cookie_header(
            state,
            ACCESS_COOKIE,
            &session.access_token,
            state.access_ttl_secs,
            true,
            same_site,
        )?,
    );
    headers.append(
        SET_COOKIE,
        cookie_header(
            state,
            REFRESH_COOKIE,
            &session.refresh_token,
            state.refresh_ttl_secs,
            true,
            same_site,
        )?,
    );
    headers.append(
        SET_COOKIE,
        cookie_header(
            state,
            LOGGED_IN_COOKIE,
            "true",
            state.refresh_ttl_secs,
            false,
            same_site,
        )?,
    );
    Ok(response)
}

// ==================
// Registration
// ==================

/// POST /api/register - create an account with password confirmation
pub(super) async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let email = body.email.trim();
    if !email.contains('@') || email.len() < 3 {
        return Err(AuthError::Validation(
            "Enter a valid email address.".to_string(),
        ));
    }
    if body.password.len() < 8 {
        return Err(AuthError::Validation(
            "Password must be at least 8 characters.".to_string(),
        ));
    }
    if body.password != body.password2 {
        return Err(AuthError::Validation(
            "Password fields didn't match.".to_string(),
        ));
    }

    let password_hash = crypto::hash_password(&body.password)?;
    let user = state.users.create(NewUser {
        email: email.to_string(),
        username: None,
        password_hash: Some(password_hash),
        image: None,
        is_active: true,
    })?;

    info!(user_id = user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            email: user.email,
        }),
    ))
}

// ==================
// Login / Logout
// ==================

/// POST /api/login - password stage
///
/// Issues cookies immediately, or answers with a second-factor challenge
/// and no cookies at all.
pub(super) async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let now = Utc::now();
    match state.login.submit(&body.email, &body.password, now)? {
        LoginOutcome::Authenticated(session) => signed_in_response(&state, session, SameSite::Lax),
        LoginOutcome::SecondFactorRequired { user_id } => Ok(Json(ChallengeResponse {
            requires_2fa: true,
            user_id,
        })
        .into_response()),
    }
}

/// POST /api/2fa/verify - second-factor stage
pub(super) async fn verify_second_factor(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SecondFactorRequest>,
) -> Result<Response, AuthError> {
    let now = Utc::now();
    let session = state.login.submit_second_factor(body.user_id, &body.code, now)?;
    signed_in_response(&state, session, SameSite::Lax)
}

/// POST /api/logout - revoke presented tokens, clear all cookies
///
/// Always succeeds, whatever state the tokens are in.
pub(super) async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let now = Utc::now();
    let access = cookies::read_cookie(&headers, ACCESS_COOKIE);
    let refresh = cookies::read_cookie(&headers, REFRESH_COOKIE);
    state.login.logout(access.as_deref(), refresh.as_deref(), now)?;

    let mut response = Json(MessageResponse {
        message: "Logout successful".to_string(),
    })
    .into_response();
    let response_headers = response.headers_mut();
    for (name, http_only) in [
        (ACCESS_COOKIE, true),
        (REFRESH_COOKIE, true),
        (LOGGED_IN_COOKIE, false),
    ] {
        response_headers.append(
            SET_COOKIE,
            cookies::clear_cookie(name, http_only, state.cookie_secure)
                .map_err(|e| AuthError::Internal(format!("cookie header: {}", e)))?,
        );
    }
    Ok(response)
}

// ==================
// Tokens
// ==================

/// POST /api/refresh - trade the refresh cookie for a new access cookie
pub(super) async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let now = Utc::now();
    let token =
        cookies::read_cookie(&headers, REFRESH_COOKIE).ok_or(AuthError::InvalidRefreshToken)?;
    let (_, access_token) = state.login.refresh(&token, now)?;

    let mut response = Json(MessageResponse {
        message: "Refresh successful".to_string(),
    })
    .into_response();
    response.headers_mut().append(
        SET_COOKIE,
        cookie_header(
            &state,
            ACCESS_COOKIE,
            &access_token,
            state.access_ttl_secs,
            true,
            SameSite::Lax,
        )?,
    );
    Ok(response)
}

/// GET /api/user - profile of the signed-in user
pub(super) async fn current_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, AuthError> {
    let now = Utc::now();
    let user = cookie_user(&state, &headers, now)?;
    Ok(Json(user.profile()))
}

// ==================
// Second-Factor Setup
// ==================

/// GET /api/2fa/setup - generate enrollment material
///
/// The material is stashed server side and only applied once the user
/// proves their authenticator via the POST counterpart.
pub(super) async fn begin_two_factor_setup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SetupResponse>, AuthError> {
    let now = Utc::now();
    let user = cookie_user(&state, &headers, now)?;
    let pending = state.two_factor.begin_setup(user.id)?;

    let stash = serde_json::to_string(&pending)
        .map_err(|e| AuthError::Internal(format!("setup stash: {}", e)))?;
    state.ephemeral.set(
        &keys::second_factor_setup(user.id),
        &stash,
        state.setup_stash_ttl,
        now,
    )?;

    Ok(Json(SetupResponse {
        secret: pending.secret,
        qr_code: pending.provisioning_uri,
        backup_codes: pending.backup_codes,
    }))
}

/// POST /api/2fa/setup - confirm enrollment with a first code
///
/// A wrong code leaves the stash in place so the user can retry without
/// rescanning.
pub(super) async fn confirm_two_factor_setup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CodeRequest>,
) -> Result<Json<SetupConfirmedResponse>, AuthError> {
    let now = Utc::now();
    let user = cookie_user(&state, &headers, now)?;

    let stash_key = keys::second_factor_setup(user.id);
    let stash = state
        .ephemeral
        .get(&stash_key, now)?
        .ok_or(AuthError::SecondFactorSessionExpired)?;
    let pending: PendingSetup = serde_json::from_str(&stash)
        .map_err(|e| AuthError::Internal(format!("setup stash: {}", e)))?;

    state.two_factor.confirm_setup(user.id, &pending, &body.code, now)?;
    state.ephemeral.remove(&stash_key, now)?;

    Ok(Json(SetupConfirmedResponse {
        message: "Two-factor authentication enabled".to_string(),
        backup_codes: pending.backup_codes,
    }))
}

/// POST /api/2fa/disable - turn the second factor off (TOTP code required)
pub(super) async fn disable_two_factor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CodeRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    let now = Utc::now();
    let user = cookie_user(&state, &headers, now)?;
    state.two_factor.disable(user.id, &body.code, now)?;
    Ok(Json(MessageResponse {
        message: "Two-factor authentication disabled".to_string(),
    }))
}

// ==================
// Federated Sign-In
// ==================

/// POST /api/oauth/:provider - sign in with an authorization code
pub(super) async fn oauth_login(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(body): Json<OAuthRequest>,
) -> Result<Response, AuthError> {
    let now = Utc::now();
    let provider: Provider = provider.parse()?;
    let identity = state.gateway.fetch_identity(provider, &body.code).await?;
    let session = state.provisioner.provision_identity(&identity, now)?;

    // Frontends on another origin need these cookies on a fetch() response
    signed_in_response(&state, session, SameSite::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::two_factor::{generate_totp, TotpConfig};
    use crate::config::Config;
    use crate::http_server::build_router;
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use tower::ServiceExt;

    const PASSWORD: &str = "correct horse battery";

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.auth.secret = "test-secret".to_string();
        Arc::new(AppState::from_config(&config).unwrap())
    }

    fn app() -> (Arc<AppState>, Router) {
        let state = test_state();
        (Arc::clone(&state), build_router(state))
    }

    fn seed_user(state: &AppState, email: &str) -> User {
        state
            .users
            .create(NewUser {
                email: email.to_string(),
                username: None,
                password_hash: Some(crypto::hash_password(PASSWORD).unwrap()),
                image: None,
                is_active: true,
            })
            .unwrap()
    }

    fn enable_second_factor(state: &AppState, user: &User) -> String {
        let secret = crypto::generate_totp_secret();
        let mut updated = user.clone();
        updated.two_factor_enabled = true;
        updated.totp_secret = Some(secret.clone());
        updated.backup_codes = vec!["aaaa000011112222".to_string()];
        state.users.update(&updated).unwrap();
        secret
    }

    fn totp_now(secret: &str) -> String {
        generate_totp(secret, Utc::now().timestamp() as u64, &TotpConfig::default()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn json_request_with_cookie(
        method: &str,
        uri: &str,
        cookie: &str,
        body: serde_json::Value,
    ) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, cookie)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bare_request(method: &str, uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn cookie_value(set_cookies: &[String], name: &str) -> Option<String> {
        let prefix = format!("{}=", name);
        set_cookies
            .iter()
            .find(|c| c.starts_with(&prefix))
            .and_then(|c| c.split(';').next())
            .map(|pair| pair[prefix.len()..].to_string())
    }

    async fn sign_in(router: &Router, email: &str) -> (String, String) {
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": email, "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        let access = cookie_value(&cookies, ACCESS_COOKIE).unwrap();
        let refresh = cookie_value(&cookies, REFRESH_COOKIE).unwrap();
        (access, refresh)
    }

    #[tokio::test]
    async fn test_health() {
        let (_, router) = app();
        let response = router
            .oneshot(bare_request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn test_register_creates_account() {
        let (_, router) = app();
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/register",
                serde_json::json!({
                    "email": "new@example.com",
                    "password": "long enough password",
                    "password2": "long enough password"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["email"], "new@example.com");
        assert!(body["id"].is_i64());

        // Same email again conflicts
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/register",
                serde_json::json!({
                    "email": "new@example.com",
                    "password": "long enough password",
                    "password2": "long enough password"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["code"], "EMAIL_EXISTS");
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (_, router) = app();

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/register",
                serde_json::json!({
                    "email": "a@example.com",
                    "password": "long enough password",
                    "password2": "something else"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("didn't match"));

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/register",
                serde_json::json!({
                    "email": "a@example.com",
                    "password": "short",
                    "password2": "short"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(json_request(
                "POST",
                "/api/register",
                serde_json::json!({
                    "email": "not-an-email",
                    "password": "long enough password",
                    "password2": "long enough password"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_sets_three_session_cookies() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");

        let response = router
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 3);

        let access = cookies.iter().find(|c| c.starts_with("access_token=")).unwrap();
        assert!(access.contains("HttpOnly"));
        assert!(access.contains("SameSite=Lax"));
        assert!(access.contains("Max-Age=3600"));

        let refresh = cookies.iter().find(|c| c.starts_with("refresh_token=")).unwrap();
        assert!(refresh.contains("HttpOnly"));
        assert!(refresh.contains("Max-Age=86400"));

        let logged_in = cookies.iter().find(|c| c.starts_with("logged_in=true")).unwrap();
        assert!(!logged_in.contains("HttpOnly"));
        assert!(logged_in.contains("Max-Age=86400"));

        let body = body_json(response).await;
        assert_eq!(body["message"], "Login successful");
        assert_eq!(body["user"]["email"], "a@example.com");
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");

        let response = router
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": "wrong" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "CREDENTIAL_INVALID");
    }

    #[tokio::test]
    async fn test_second_factor_challenge_flow() {
        let (state, router) = app();
        let user = seed_user(&state, "a@example.com");
        let secret = enable_second_factor(&state, &user);

        // Password stage answers with a challenge and no cookies
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookies(&response).is_empty());
        let body = body_json(response).await;
        assert_eq!(body["requires_2fa"], true);
        assert_eq!(body["user_id"], user.id);

        // Code stage completes with all three cookies
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/2fa/verify",
                serde_json::json!({ "user_id": user.id, "code": totp_now(&secret) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(set_cookies(&response).len(), 3);
        let body = body_json(response).await;
        assert_eq!(body["user"]["two_factor_enabled"], true);
    }

    #[tokio::test]
    async fn test_second_factor_verify_without_challenge() {
        let (state, router) = app();
        let user = seed_user(&state, "a@example.com");
        let secret = enable_second_factor(&state, &user);

        let response = router
            .oneshot(json_request(
                "POST",
                "/api/2fa/verify",
                serde_json::json!({ "user_id": user.id, "code": totp_now(&secret) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "SECOND_FACTOR_SESSION_EXPIRED");
    }

    #[tokio::test]
    async fn test_current_user() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");

        let response = router
            .clone()
            .oneshot(bare_request("GET", "/api/user", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "AUTH_REQUIRED");

        let (access, _) = sign_in(&router, "a@example.com").await;
        let cookie = format!("access_token={}", access);
        let response = router
            .oneshot(bare_request("GET", "/api/user", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["email"], "a@example.com");
        assert!(body.get("password_hash").is_none());
        assert!(body.get("totp_secret").is_none());
    }

    #[tokio::test]
    async fn test_refresh_rotates_access_cookie_only() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");
        let (_, refresh) = sign_in(&router, "a@example.com").await;

        let cookie = format!("refresh_token={}", refresh);
        let response = router
            .clone()
            .oneshot(bare_request("POST", "/api/refresh", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("access_token="));
        assert!(cookies[0].contains("Max-Age=3600"));

        let body = body_json(response).await;
        assert_eq!(body["message"], "Refresh successful");

        // The fresh access token is usable
        let access = cookie_value(&cookies, ACCESS_COOKIE).unwrap();
        let cookie = format!("access_token={}", access);
        let response = router
            .oneshot(bare_request("GET", "/api/user", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refresh_failures_are_uniform() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");
        let (access, _) = sign_in(&router, "a@example.com").await;

        // No cookie at all
        let response = router
            .clone()
            .oneshot(bare_request("POST", "/api/refresh", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "REFRESH_INVALID");

        // An access token in the refresh slot
        let cookie = format!("refresh_token={}", access);
        let response = router
            .clone()
            .oneshot(bare_request("POST", "/api/refresh", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "REFRESH_INVALID");

        // Garbage
        let response = router
            .oneshot(bare_request(
                "POST",
                "/api/refresh",
                Some("refresh_token=garbage"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "REFRESH_INVALID");
    }

    #[tokio::test]
    async fn test_logout_clears_cookies_and_revokes() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");
        let (access, refresh) = sign_in(&router, "a@example.com").await;

        let cookie = format!("access_token={}; refresh_token={}", access, refresh);
        let response = router
            .clone()
            .oneshot(bare_request("POST", "/api/logout", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 3);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
        let body = body_json(response).await;
        assert_eq!(body["message"], "Logout successful");

        // The revoked access token is dead even though it has not expired
        let cookie = format!("access_token={}", access);
        let response = router
            .clone()
            .oneshot(bare_request("GET", "/api/user", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "TOKEN_BLACKLISTED");

        // Logout again with the same tokens still succeeds
        let cookie = format!("access_token={}; refresh_token={}", access, refresh);
        let response = router
            .oneshot(bare_request("POST", "/api/logout", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_two_factor_setup_end_to_end() {
        let (state, router) = app();
        seed_user(&state, "a@example.com");
        let (access, _) = sign_in(&router, "a@example.com").await;
        let cookie = format!("access_token={}", access);

        // Begin: material is handed out but nothing is enabled yet
        let response = router
            .clone()
            .oneshot(bare_request("GET", "/api/2fa/setup", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let secret = body["secret"].as_str().unwrap().to_string();
        assert!(body["qr_code"].as_str().unwrap().starts_with("otpauth://totp/"));
        assert_eq!(body["backup_codes"].as_array().unwrap().len(), 8);

        // A wrong code is rejected and the stash survives
        let response = router
            .clone()
            .oneshot(json_request_with_cookie(
                "POST",
                "/api/2fa/setup",
                &cookie,
                serde_json::json!({ "code": "000000" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "SECOND_FACTOR_INVALID");

        // The right code enables the factor
        let response = router
            .clone()
            .oneshot(json_request_with_cookie(
                "POST",
                "/api/2fa/setup",
                &cookie,
                serde_json::json!({ "code": totp_now(&secret) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["backup_codes"].as_array().unwrap().len(), 8);

        // From now on the password stage answers with a challenge
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["requires_2fa"], true);
    }

    #[tokio::test]
    async fn test_two_factor_setup_requires_confirmation() {
        let (state, router) = app();
        let user = seed_user(&state, "a@example.com");
        let (access, _) = sign_in(&router, "a@example.com").await;
        let cookie = format!("access_token={}", access);

        // Confirm without ever calling begin
        let response = router
            .oneshot(json_request_with_cookie(
                "POST",
                "/api/2fa/setup",
                &cookie,
                serde_json::json!({ "code": "123456" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["code"],
            "SECOND_FACTOR_SESSION_EXPIRED"
        );

        // Nothing was enabled
        let stored = state.users.find_by_id(user.id).unwrap().unwrap();
        assert!(!stored.two_factor_enabled);
    }

    #[tokio::test]
    async fn test_disable_two_factor() {
        let (state, router) = app();
        let user = seed_user(&state, "a@example.com");
        let secret = enable_second_factor(&state, &user);

        // Complete the challenge login to obtain an access cookie
        router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": PASSWORD }),
            ))
            .await
            .unwrap();
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/2fa/verify",
                serde_json::json!({ "user_id": user.id, "code": totp_now(&secret) }),
            ))
            .await
            .unwrap();
        let access = cookie_value(&set_cookies(&response), ACCESS_COOKIE).unwrap();
        let cookie = format!("access_token={}", access);

        // Backup codes are not accepted for disabling
        let response = router
            .clone()
            .oneshot(json_request_with_cookie(
                "POST",
                "/api/2fa/disable",
                &cookie,
                serde_json::json!({ "code": "aaaa000011112222" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(json_request_with_cookie(
                "POST",
                "/api/2fa/disable",
                &cookie,
                serde_json::json!({ "code": totp_now(&secret) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Login is single-stage again
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/login",
                serde_json::json!({ "email": "a@example.com", "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(set_cookies(&response).len(), 3);
    }

    #[tokio::test]
    async fn test_oauth_provider_validation() {
        let (_, router) = app();

        // Unknown provider name
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/oauth/gitlab",
                serde_json::json!({ "code": "abc" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Known provider, but no credentials configured
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/oauth/github",
                serde_json::json!({ "code": "abc" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not configured"));
    }
}
