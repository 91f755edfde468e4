//! Offline manifest construction and verification.
//!
//! A manifest is a signed snapshot of the ticket ids still Valid for an event
//! at generation time. The signing payload is canonical JSON (sorted keys,
//! unix timestamp) hashed with SHA-256; the tenant key signs the digest hex,
//! the same envelope mechanics as credentials.

use std::collections::BTreeSet;

use ed25519_dalek::{Verifier, VerifyingKey};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::info;
use turnstile_core::{KeyProvider, OfflineManifest};
use turnstile_storage::ScanStorage;

use crate::error::OfflineError;

fn manifest_payload(
    event_id: &str,
    tenant_id: &str,
    venue_id: &str,
    generated_at: OffsetDateTime,
    version: u64,
    valid_ticket_ids: &BTreeSet<String>,
) -> String {
    let mut map = Map::new();
    map.insert("event_id".to_string(), json!(event_id));
    map.insert("tenant_id".to_string(), json!(tenant_id));
    map.insert("venue_id".to_string(), json!(venue_id));
    map.insert(
        "generated_at".to_string(),
        json!(generated_at.unix_timestamp()),
    );
    map.insert("version".to_string(), json!(version));
    map.insert(
        "valid_ticket_ids".to_string(),
        json!(valid_ticket_ids.iter().collect::<Vec<_>>()),
    );
    Value::Object(map).to_string()
}

/// SHA-256 digest hex of a manifest's canonical payload.
pub fn manifest_digest(manifest: &OfflineManifest) -> String {
    let payload = manifest_payload(
        &manifest.event_id,
        &manifest.tenant_id,
        &manifest.venue_id,
        manifest.generated_at,
        manifest.version,
        &manifest.valid_ticket_ids,
    );
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Snapshot the still-valid ticket ids for an event into a signed manifest
/// and persist it. The version is one past the latest stored version.
pub async fn build_manifest<S: ScanStorage>(
    event_id: &str,
    tenant_id: &str,
    venue_id: &str,
    storage: &S,
    keys: &dyn KeyProvider,
) -> Result<OfflineManifest, OfflineError> {
    let valid_ticket_ids = storage
        .valid_ticket_ids(event_id)
        .await
        .map_err(|e| OfflineError::Storage(e.to_string()))?;
    let version = storage
        .latest_manifest(event_id)
        .await
        .map_err(|e| OfflineError::Storage(e.to_string()))?
        .map(|m| m.version + 1)
        .unwrap_or(1);
    let generated_at = OffsetDateTime::now_utc();

    let payload = manifest_payload(
        event_id,
        tenant_id,
        venue_id,
        generated_at,
        version,
        &valid_ticket_ids,
    );
    let digest = format!("{:x}", Sha256::digest(payload.as_bytes()));
    let signature = keys.sign(digest.as_bytes(), tenant_id)?;

    let manifest = OfflineManifest {
        event_id: event_id.to_string(),
        tenant_id: tenant_id.to_string(),
        venue_id: venue_id.to_string(),
        generated_at,
        version,
        valid_ticket_ids,
        signature,
    };

    storage
        .put_manifest(&manifest)
        .await
        .map_err(|e| OfflineError::Storage(e.to_string()))?;

    info!(
        event_id = %event_id,
        version = manifest.version,
        tickets = manifest.valid_ticket_ids.len(),
        "offline manifest generated"
    );
    Ok(manifest)
}

/// Verify a manifest signature against the tenant's verifying key.
pub fn verify_manifest(
    manifest: &OfflineManifest,
    key: &VerifyingKey,
) -> Result<(), OfflineError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let digest = manifest_digest(manifest);
    let sig_bytes = BASE64
        .decode(&manifest.signature)
        .map_err(|e| OfflineError::ManifestInvalid(format!("bad signature encoding: {e}")))?;
    let sig_arr: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| OfflineError::ManifestInvalid("bad signature length".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_arr);
    key.verify(digest.as_bytes(), &signature)
        .map_err(|_| OfflineError::ManifestInvalid("signature mismatch".to_string()))
}
