//! Per-tenant Ed25519 signing.
//!
//! The [`KeyProvider`] trait is the seam to an external signing-key service.
//! [`Keyring`] is the in-memory reference implementation used by tests, the
//! CLI, and single-process deployments.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Signing-key provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SigningError {
    /// No signing key is registered for the tenant.
    #[error("no signing key registered for tenant '{tenant_id}'")]
    SigningUnavailable { tenant_id: String },

    /// Signature or key bytes could not be decoded.
    #[error("invalid key or signature material: {0}")]
    InvalidMaterial(String),
}

/// Narrow interface to the signing-key provider collaborator.
pub trait KeyProvider: Send + Sync {
    /// Sign `payload` with the tenant's key; returns the base64 signature.
    fn sign(&self, payload: &[u8], tenant_id: &str) -> Result<String, SigningError>;

    /// Verify a base64 signature over `payload` against the tenant's key.
    ///
    /// Returns `Ok(false)` for a well-formed but non-matching signature and
    /// for undecodable signature bytes; `Err(SigningUnavailable)` only when
    /// the tenant has no registered key at all.
    fn verify(&self, payload: &[u8], signature_b64: &str, tenant_id: &str)
        -> Result<bool, SigningError>;

    /// The tenant's verifying key, for embedding in distributed artifacts.
    fn verifying_key(&self, tenant_id: &str) -> Result<VerifyingKey, SigningError>;
}

/// In-memory per-tenant keyring.
#[derive(Default)]
pub struct Keyring {
    keys: BTreeMap<String, SigningKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Keyring::default()
    }

    /// Generate and register a fresh keypair for a tenant, returning the
    /// verifying key.
    pub fn generate(&mut self, tenant_id: &str) -> VerifyingKey {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        self.keys.insert(tenant_id.to_string(), signing_key);
        verifying_key
    }

    /// Register an existing key for a tenant.
    pub fn insert(&mut self, tenant_id: &str, key: SigningKey) {
        self.keys.insert(tenant_id.to_string(), key);
    }

    fn key_for(&self, tenant_id: &str) -> Result<&SigningKey, SigningError> {
        self.keys
            .get(tenant_id)
            .ok_or_else(|| SigningError::SigningUnavailable {
                tenant_id: tenant_id.to_string(),
            })
    }
}

impl KeyProvider for Keyring {
    fn sign(&self, payload: &[u8], tenant_id: &str) -> Result<String, SigningError> {
        let key = self.key_for(tenant_id)?;
        let signature = key.sign(payload);
        Ok(BASE64.encode(signature.to_bytes()))
    }

    fn verify(
        &self,
        payload: &[u8],
        signature_b64: &str,
        tenant_id: &str,
    ) -> Result<bool, SigningError> {
        let key = self.key_for(tenant_id)?.verifying_key();
        let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
            return Ok(false);
        };
        let sig_arr: [u8; 64] = match sig_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return Ok(false),
        };
        let signature = Signature::from_bytes(&sig_arr);
        Ok(key.verify(payload, &signature).is_ok())
    }

    fn verifying_key(&self, tenant_id: &str) -> Result<VerifyingKey, SigningError> {
        Ok(self.key_for(tenant_id)?.verifying_key())
    }
}

/// Decode a base64-encoded 32-byte Ed25519 verifying key.
pub fn decode_verifying_key(b64: &str) -> Result<VerifyingKey, SigningError> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| SigningError::InvalidMaterial(format!("bad base64: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidMaterial("expected 32 key bytes".to_string()))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| SigningError::InvalidMaterial(format!("bad key material: {e}")))
}

/// Encode a verifying key as base64 for embedding in JSON artifacts.
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.to_bytes())
}
