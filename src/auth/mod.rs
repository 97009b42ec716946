//! # Gatehouse Auth Module
//!
//! Authentication and session management: password login with an optional
//! TOTP second factor, stateless signed tokens with a revocation blacklist,
//! and federated sign-in through GitHub and Google.

pub mod crypto;
pub mod ephemeral;
pub mod errors;
pub mod login;
pub mod oauth;
pub mod tokens;
pub mod two_factor;
pub mod user;

pub use ephemeral::{EphemeralStore, InMemoryEphemeralStore};
pub use errors::{AuthError, AuthResult, ErrorResponse};
pub use login::{AuthenticatedSession, LoginFlow, LoginOutcome};
pub use oauth::{FederatedProvisioner, Provider, ProviderGateway, ProviderIdentity, ProviderSettings};
pub use tokens::{TokenClaims, TokenEngine, TokenKind};
pub use two_factor::{PendingSetup, TotpConfig, TwoFactorEngine};
pub use user::{InMemoryUserStore, NewUser, User, UserProfile, UserStore};
