//! gatehouse - A strict, explicit authentication and session core
//!
//! Password login with an optional TOTP second factor, signed session
//! tokens with revocation, federated sign-in, and the REST surface that
//! exposes them.

pub mod auth;
pub mod config;
pub mod http_server;
