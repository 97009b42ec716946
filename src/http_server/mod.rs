//! # HTTP Server
//!
//! REST surface over the auth engines. One [`AppState`] owns every engine
//! and store; handlers live in [`auth_routes`].

pub mod auth_routes;
pub mod cookies;

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::ephemeral::InMemoryEphemeralStore;
use crate::auth::errors::{AuthError, AuthResult, ErrorResponse};
use crate::auth::login::LoginFlow;
use crate::auth::oauth::{FederatedProvisioner, ProviderGateway};
use crate::auth::tokens::TokenEngine;
use crate::auth::two_factor::TwoFactorEngine;
use crate::auth::user::InMemoryUserStore;
use crate::config::Config;

// ==================
// Shared State
// ==================

/// Everything the handlers need, wired once at startup
pub struct AppState {
    pub login: LoginFlow<InMemoryUserStore, InMemoryEphemeralStore>,
    pub two_factor: TwoFactorEngine<InMemoryUserStore>,
    pub provisioner: FederatedProvisioner<InMemoryUserStore>,
    pub gateway: ProviderGateway,
    pub users: Arc<InMemoryUserStore>,
    pub ephemeral: Arc<InMemoryEphemeralStore>,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub setup_stash_ttl: chrono::Duration,
    pub cookie_secure: bool,
    cors_origins: Vec<HeaderValue>,
}

impl AppState {
    /// Build the full engine stack from validated configuration
    pub fn from_config(config: &Config) -> AuthResult<Self> {
        let users = Arc::new(InMemoryUserStore::new());
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());
        let tokens = Arc::new(TokenEngine::new(
            &config.auth.secret,
            config.access_lifetime(),
            config.refresh_lifetime(),
        ));

        let two_factor = TwoFactorEngine::new(Arc::clone(&users), config.totp_config());
        let login = LoginFlow::new(
            Arc::clone(&users),
            Arc::clone(&ephemeral),
            Arc::clone(&tokens),
            two_factor.clone(),
            config.pending_second_factor_ttl(),
        );
        let gateway = ProviderGateway::new(
            config.providers.github.clone(),
            config.providers.google.clone(),
        )?;
        let provisioner = FederatedProvisioner::new(Arc::clone(&users), Arc::clone(&tokens));

        let mut cors_origins = Vec::new();
        for origin in &config.server.cors_origins {
            let value = origin
                .parse::<HeaderValue>()
                .map_err(|_| AuthError::Validation(format!("bad CORS origin: {}", origin)))?;
            cors_origins.push(value);
        }

        Ok(Self {
            login,
            two_factor,
            provisioner,
            gateway,
            users,
            ephemeral,
            access_ttl_secs: config.auth.access_token_ttl_secs,
            refresh_ttl_secs: config.auth.refresh_token_ttl_secs,
            setup_stash_ttl: config.setup_stash_ttl(),
            cookie_secure: config.auth.cookie_secure,
            cors_origins,
        })
    }
}

// ==================
// Error Mapping
// ==================

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Internal faults are logged in full but never echoed to clients
        if let AuthError::Internal(detail) = &self {
            tracing::error!(%detail, "internal fault");
            let body = ErrorResponse {
                error: "Internal error".to_string(),
                code: self.error_code(),
            };
            return (status, Json(body)).into_response();
        }

        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

// ==================
// Router
// ==================

/// Build the application router with tracing and credentialed CORS
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(state.cors_origins.clone())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health))
        .route("/api/register", post(auth_routes::register))
        .route("/api/login", post(auth_routes::login))
        .route("/api/logout", post(auth_routes::logout))
        .route("/api/refresh", post(auth_routes::refresh))
        .route("/api/user", get(auth_routes::current_user))
        .route(
            "/api/2fa/setup",
            get(auth_routes::begin_two_factor_setup).post(auth_routes::confirm_two_factor_setup),
        )
        .route("/api/2fa/verify", post(auth_routes::verify_second_factor))
        .route("/api/2fa/disable", post(auth_routes::disable_two_factor))
        .route("/api/oauth/:provider", post(auth_routes::oauth_login))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// GET /health - liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
