//! HS256 bearer token verification.

use super::TokenVerifier;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims this core relies on. The issuance format is owned by the
/// external `/auth/google` surface; this is the minimal shape the core
/// reads back out.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
}

pub struct HmacTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl HmacTokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for HmacTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(VerifiedIdentity {
            user_id: data.claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(secret: &str, user_id: Uuid, exp: usize) -> String {
        let claims = Claims { sub: user_id, exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn verify_accepts_a_well_formed_token() {
        let user_id = Uuid::new_v4();
        let token = issue("shh", user_id, usize::MAX);
        let verifier = HmacTokenVerifier::new("shh");
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, user_id);
    }

    #[tokio::test]
    async fn verify_rejects_a_token_signed_with_a_different_secret() {
        let token = issue("shh", Uuid::new_v4(), usize::MAX);
        let verifier = HmacTokenVerifier::new("different");
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn verify_rejects_an_expired_token() {
        let token = issue("shh", Uuid::new_v4(), 0);
        let verifier = HmacTokenVerifier::new("shh");
        assert!(verifier.verify(&token).await.is_err());
    }
}
