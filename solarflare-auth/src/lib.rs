//! Solarflare subscriber authentication
//!
//! Verifies pre-issued HMAC-signed JWTs and extracts the single claim that
//! scopes RLS-enabled tables. Token issuance lives outside the relay.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod jwt;

pub use jwt::{scope_from_claims, Claims, JwtVerifier};
