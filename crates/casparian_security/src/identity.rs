//! Dual-mode identity and signing (§9 "Dual auth modes").
//!
//! Signature verification uses either a symmetric MAC with a local secret
//! (`AUTH_MODE=local`) or an Ed25519 signature with an enterprise identity
//! provider's public key (`AUTH_MODE=enterprise`). Both fit the same
//! capability set so the Gatekeeper and publish path don't need to know
//! which mode is active.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("signing key error: {0}")]
    KeyError(String),

    #[error("signature does not verify")]
    SignatureMismatch,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// The capability set every auth mode implements: authenticate a caller,
/// sign an artifact hash, and verify a claimed signature.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<User, AuthenticationError>;
    fn sign_artifact(&self, artifact_hash: &str) -> Result<String, AuthenticationError>;
    fn verify_signature(&self, artifact_hash: &str, signature: &str) -> Result<bool, AuthenticationError>;
}

/// `AUTH_MODE=local`: a shared HMAC-SHA256 secret. Verification uses
/// constant-time comparison (§4.3 check 5) via `hmac`'s `verify_slice`.
pub struct LocalProvider {
    secret: Vec<u8>,
}

impl LocalProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    fn mac(&self) -> Result<HmacSha256, AuthenticationError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| AuthenticationError::KeyError(e.to_string()))
    }
}

impl IdentityProvider for LocalProvider {
    fn authenticate(&self, token: &str) -> Result<User, AuthenticationError> {
        if token != std::str::from_utf8(&self.secret).unwrap_or_default() {
            return Err(AuthenticationError::InvalidToken);
        }
        Ok(User { id: "local".into(), name: "local".into(), email: String::new() })
    }

    fn sign_artifact(&self, artifact_hash: &str) -> Result<String, AuthenticationError> {
        let mut mac = self.mac()?;
        mac.update(artifact_hash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_signature(&self, artifact_hash: &str, signature: &str) -> Result<bool, AuthenticationError> {
        let expected = hex::decode(signature).map_err(|_| AuthenticationError::SignatureMismatch)?;
        let mut mac = self.mac()?;
        mac.update(artifact_hash.as_bytes());
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

/// `AUTH_MODE=enterprise`: Ed25519 signatures against an enterprise
/// identity provider's keypair.
pub struct EnterpriseProvider {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl EnterpriseProvider {
    /// A verifier-only provider (checks signatures, cannot produce new ones).
    pub fn verifier(verifying_key: VerifyingKey) -> Self {
        Self { signing_key: None, verifying_key }
    }

    /// A full provider that can also sign artifacts.
    pub fn with_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self { signing_key: Some(signing_key), verifying_key }
    }
}

impl IdentityProvider for EnterpriseProvider {
    fn authenticate(&self, _token: &str) -> Result<User, AuthenticationError> {
        // Token exchange with the enterprise identity backend is an external
        // collaborator; this provider only covers signing/verification.
        Err(AuthenticationError::InvalidToken)
    }

    fn sign_artifact(&self, artifact_hash: &str) -> Result<String, AuthenticationError> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| AuthenticationError::KeyError("no signing key available".into()))?;
        let signature = signing_key.sign(artifact_hash.as_bytes());
        Ok(hex::encode(signature.to_bytes()))
    }

    fn verify_signature(&self, artifact_hash: &str, signature: &str) -> Result<bool, AuthenticationError> {
        let bytes = hex::decode(signature).map_err(|_| AuthenticationError::SignatureMismatch)?;
        let sig_bytes: [u8; 64] = bytes.try_into().map_err(|_| AuthenticationError::SignatureMismatch)?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(self.verifying_key.verify(artifact_hash.as_bytes(), &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn local_provider_roundtrips_signature() {
        let provider = LocalProvider::new("top-secret");
        let signature = provider.sign_artifact("abc123").unwrap();
        assert!(provider.verify_signature("abc123", &signature).unwrap());
        assert!(!provider.verify_signature("different", &signature).unwrap());
    }

    #[test]
    fn local_provider_rejects_malformed_signature() {
        let provider = LocalProvider::new("top-secret");
        assert!(!provider.verify_signature("abc123", "not-hex!!").unwrap_or(false));
    }

    #[test]
    fn enterprise_provider_roundtrips_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let provider = EnterpriseProvider::with_signing_key(signing_key);
        let signature = provider.sign_artifact("abc123").unwrap();
        assert!(provider.verify_signature("abc123", &signature).unwrap());
        assert!(!provider.verify_signature("tampered", &signature).unwrap());
    }

    #[test]
    fn enterprise_verifier_without_key_cannot_sign() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let verifier = EnterpriseProvider::verifier(verifying_key);
        assert!(verifier.sign_artifact("abc123").is_err());
    }
}
