use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Resolves a handshake token to the user identity it was issued for.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedClaims {
    pub user_id: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// HS256 verifier sharing its secret with the account service that issues
/// feed tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    enc: EncodingKey,
    dec: DecodingKey,
    ttl: Duration,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret),
            dec: DecodingKey::from_secret(secret),
            ttl: Duration::minutes(20),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mints a token for `user_id`. Used by development tooling and tests.
    pub fn sign(&self, user_id: &str) -> Result<String, AuthError> {
        let claims = FeedClaims {
            user_id: user_id.to_string(),
            exp: (Utc::now() + self.ttl).timestamp(),
            session_id: None,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.enc,
        )?)
    }

    pub fn decode(&self, token: &str) -> Result<FeedClaims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<FeedClaims>(token, &self.dec, &validation)?;
        Ok(data.claims)
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let claims = self.decode(token)?;
        let user_id = claims.user_id.trim();
        if user_id.is_empty() {
            return Err(AuthError::MissingIdentity);
        }
        Ok(user_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn sign_and_verify_round_trip() {
        let verifier = JwtVerifier::new(b"feed-secret");
        let token = verifier.sign("u1").unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), "u1");
    }

    #[test_timeout::timeout]
    fn foreign_secret_is_rejected() {
        let token = JwtVerifier::new(b"other-secret").sign("u1").unwrap();
        let err = JwtVerifier::new(b"feed-secret").verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test_timeout::timeout]
    fn expired_token_is_rejected() {
        let verifier = JwtVerifier::new(b"feed-secret").with_ttl(Duration::minutes(-10));
        let token = verifier.sign("u1").unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test_timeout::timeout]
    fn blank_token_and_identity_are_rejected() {
        let verifier = JwtVerifier::new(b"feed-secret");
        assert!(matches!(verifier.verify("  "), Err(AuthError::Missing)));

        let token = verifier.sign("").unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::MissingIdentity)
        ));
    }
}
