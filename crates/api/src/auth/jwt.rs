//! JWT access token validation
//!
//! Tokens are issued by the identity service; this crate only verifies them.
//! [`JwtManager::generate_access_token`] exists for local tooling and tests.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// JWT claims carried by Finplan access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Email
    pub email: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    /// JWT ID
    pub jti: String,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, access_token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_token_expiry_hours,
        }
    }

    /// Generate an access token for `user_id`
    pub fn generate_access_token(&self, user_id: Uuid, email: &str) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.access_token_expiry_hours);

        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode an access token. Only HS256 is accepted.
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // clock skew tolerance, seconds

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_token_generation_and_validation() {
        let jwt = JwtManager::new(SECRET, 24);
        let user_id = Uuid::new_v4();

        let token = jwt
            .generate_access_token(user_id, "ana@example.com")
            .expect("Failed to generate token");
        let claims = jwt.validate_access_token(&token).expect("Invalid token");

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "ana@example.com");
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_token_signed_with_other_secret_rejected() {
        let issuer = JwtManager::new("another-secret-key-at-least-32-chars", 24);
        let token = issuer
            .generate_access_token(Uuid::new_v4(), "ana@example.com")
            .expect("Failed to generate token");

        let jwt = JwtManager::new(SECRET, 24);
        assert!(jwt.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        // Expired well beyond the leeway
        let jwt = JwtManager::new(SECRET, -2);
        let token = jwt
            .generate_access_token(Uuid::new_v4(), "ana@example.com")
            .expect("Failed to generate token");

        assert!(matches!(
            jwt.validate_access_token(&token),
            Err(JwtError::Expired)
        ));
    }
}
