//! Local key file: tenant and device signing keys, base64-encoded.
//!
//! Development and single-venue tooling only; a production deployment keeps
//! tenant keys in the signing-key provider and device keys on the devices.

use std::collections::BTreeMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use turnstile_core::{keys::encode_verifying_key, Keyring};
use turnstile_offline::DeviceTrustStore;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyFile {
    /// tenant id -> base64 Ed25519 signing key.
    #[serde(default)]
    pub tenants: BTreeMap<String, String>,
    /// device id -> base64 Ed25519 signing key (for offline log batches).
    #[serde(default)]
    pub devices: BTreeMap<String, String>,
}

fn decode_signing_key(b64: &str) -> Result<SigningKey, String> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| format!("bad base64 key: {e}"))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "expected 32 key bytes".to_string())?;
    Ok(SigningKey::from_bytes(&arr))
}

impl KeyFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| format!("key file {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyFile::default()),
            Err(e) => Err(format!("key file {}: {e}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| format!("serialize keys: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("key file {}: {e}", path.display()))
    }

    /// Generate and store a tenant key; returns the base64 verifying key.
    pub fn generate_tenant(&mut self, tenant_id: &str) -> String {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying = encode_verifying_key(&key.verifying_key());
        self.tenants
            .insert(tenant_id.to_string(), BASE64.encode(key.to_bytes()));
        verifying
    }

    /// Generate and store a device key; returns the base64 verifying key.
    pub fn generate_device(&mut self, device_id: &str) -> String {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying = encode_verifying_key(&key.verifying_key());
        self.devices
            .insert(device_id.to_string(), BASE64.encode(key.to_bytes()));
        verifying
    }

    pub fn keyring(&self) -> Result<Keyring, String> {
        let mut keyring = Keyring::new();
        for (tenant_id, b64) in &self.tenants {
            keyring.insert(tenant_id, decode_signing_key(b64)?);
        }
        Ok(keyring)
    }

    /// Verify-only trust store with every tenant's verifying key, as a
    /// provisioned device would carry.
    pub fn trust_store(&self) -> Result<DeviceTrustStore, String> {
        let mut trust = DeviceTrustStore::new();
        for (tenant_id, b64) in &self.tenants {
            let key = decode_signing_key(b64)?;
            trust = trust.with_tenant(tenant_id, key.verifying_key());
        }
        Ok(trust)
    }

    pub fn device_key(&self, device_id: &str) -> Result<SigningKey, String> {
        let b64 = self
            .devices
            .get(device_id)
            .ok_or_else(|| format!("no key for device '{device_id}'"))?;
        decode_signing_key(b64)
    }

    pub fn device_verifying_key(&self, device_id: &str) -> Result<String, String> {
        Ok(encode_verifying_key(&self.device_key(device_id)?.verifying_key()))
    }
}
