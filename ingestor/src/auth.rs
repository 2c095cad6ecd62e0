//! Signed identity tokens (JWT, HS256).

use crate::errors::{Error, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Issues and verifies tokens for a subject. The key is fixed at startup.
#[derive(Clone)]
pub struct CredentialService {
    key: Option<Vec<u8>>,
    ttl: Duration,
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CredentialService {
    pub fn new(key: Option<String>, ttl_hours: i64) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(String::into_bytes),
            ttl: Duration::hours(ttl_hours),
        }
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn issue(&self, subject: &str) -> Result<String> {
        let key = self
            .key()
            .ok_or_else(|| Error::Signing("signing key is not configured".to_string()))?;

        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key),
        )
        .map_err(|e| Error::Signing(e.to_string()))
    }

    /// Returns the token's subject if the signature holds and it has not
    /// expired.
    pub fn verify(&self, token: &str) -> Result<String> {
        let key = self
            .key()
            .ok_or_else(|| Error::InvalidToken("no verification key".to_string()))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(key),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| Error::InvalidToken(e.to_string()))?;

        Ok(data.claims.sub)
    }
}
