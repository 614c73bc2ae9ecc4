//! JWT validation and claim extraction

use std::collections::HashSet;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;

use solarflare_common::error::{Error, Result};
use solarflare_common::types::ScopeKey;

/// Claim set of a verified token
pub type Claims = serde_json::Map<String, Value>;

/// Verifies pre-issued subscriber tokens signed with a shared secret
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for HMAC-signed tokens
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.validate_aud = false;
        // `exp` is checked whenever the issuer sets it.
        validation.required_spec_claims = HashSet::new();

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature and expiry, returning the claim set
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            }
        })?;

        Ok(token_data.claims)
    }
}

/// Read the scoping claim; absent, null or empty values are rejected.
pub fn scope_from_claims(claims: &Claims, name: &str) -> Result<ScopeKey> {
    claims
        .get(name)
        .and_then(ScopeKey::from_value)
        .ok_or_else(|| Error::MissingClaim(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret-key";

    fn token(claims: &Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn exp_in(seconds: i64) -> i64 {
        (Utc::now() + Duration::seconds(seconds)).timestamp()
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let jwt = token(&json!({"user_id": 2, "exp": exp_in(3600)}), SECRET);

        let claims = verifier.verify(&jwt).unwrap();
        assert_eq!(claims.get("user_id"), Some(&json!(2)));
    }

    #[test]
    fn test_token_without_exp_is_accepted() {
        let verifier = JwtVerifier::new(SECRET);
        let jwt = token(&json!({"user_id": "abc"}), SECRET);
        assert!(verifier.verify(&jwt).is_ok());
    }

    #[test]
    fn test_expired_token() {
        let verifier = JwtVerifier::new(SECRET);
        let jwt = token(&json!({"user_id": 2, "exp": exp_in(-3600)}), SECRET);
        assert!(matches!(verifier.verify(&jwt), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_bad_signature() {
        let verifier = JwtVerifier::new(SECRET);
        let jwt = token(&json!({"user_id": 2}), "some-other-secret");
        assert!(matches!(verifier.verify(&jwt), Err(Error::InvalidToken)));
    }

    #[test]
    fn test_malformed_token() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify("invalid.token.here"),
            Err(Error::InvalidToken)
        ));
    }

    #[test]
    fn test_scope_from_verified_claims() {
        let verifier = JwtVerifier::new(SECRET);
        let claims = verifier.verify(&token(&json!({"user_id": 2}), SECRET)).unwrap();

        let scope = scope_from_claims(&claims, "user_id").unwrap();
        assert_eq!(scope.as_str(), "2");
    }

    #[test]
    fn test_missing_or_empty_claim() {
        let verifier = JwtVerifier::new(SECRET);

        for claims in [json!({"sub": "x"}), json!({"user_id": ""}), json!({"user_id": null})] {
            let claims = verifier.verify(&token(&claims, SECRET)).unwrap();
            assert!(matches!(
                scope_from_claims(&claims, "user_id"),
                Err(Error::MissingClaim(_))
            ));
        }
    }
}
