//! JWT authentication contracts.
//!
//! The real-time core never issues tokens — it only verifies them. The
//! [`TokenVerifier`] trait is the seam: the hub takes any verifier, the
//! server binary plugs in [`JwtVerifier`], tests plug in a stub.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims embedded in access tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as string)
    pub sub: String,
    /// Username
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token does not carry a user id")]
    InvalidSubject,
}

/// Verifies bearer tokens presented on the socket handshake.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(secret: &str, sub: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            username: "alice".to_string(),
            iat: now,
            exp: now + 900,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_own_tokens() {
        let verifier = JwtVerifier::new("test-secret");
        let token = issue("test-secret", "00000000-0000-0000-0000-00000000000a");
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("test-secret");
        let token = issue("other-secret", "00000000-0000-0000-0000-00000000000a");
        assert!(verifier.verify(&token).is_err());
    }
}
