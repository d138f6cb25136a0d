//! Shared-secret credential validator.
//!
//! A credential is `<identity>.<hex(sha256(secret ":" identity))>`. An optional
//! `Bearer ` prefix is accepted so Authorization headers can be passed as-is.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::IdentityValidator;
use crate::error::IdentityError;
use crate::fanout::topic::Identity;

pub struct SignedTokenValidator {
    secret: String,
}

impl SignedTokenValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Mints a credential for `identity`.
    pub fn issue(&self, identity: &Identity) -> String {
        format!("{}.{}", identity, self.sign(identity.as_str()))
    }

    fn sign(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(identity.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl IdentityValidator for SignedTokenValidator {
    async fn validate(&self, credential: &str) -> Result<Identity, IdentityError> {
        let token = credential.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(IdentityError::Missing);
        }
        let (identity, signature) = token.rsplit_once('.').ok_or(IdentityError::Malformed)?;
        if identity.is_empty() || signature.is_empty() {
            return Err(IdentityError::Malformed);
        }

        let expected = self.sign(identity);
        // Compare every byte so timing does not leak the matching prefix.
        let matches = expected.len() == signature.len()
            && expected
                .bytes()
                .zip(signature.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if !matches {
            return Err(IdentityError::BadSignature);
        }
        Ok(Identity::from(identity))
    }
}
