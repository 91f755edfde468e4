//! Credential issuance and signature verification.
//!
//! The signing payload is the canonical JSON of every credential field except
//! the signature (`serde_json::Map` is BTreeMap-backed, so keys serialize in
//! sorted order), hashed with SHA-256. The digest hex is what gets signed, so
//! verification never depends on how a credential was transported.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::ids;
use crate::keys::{KeyProvider, SigningError};
use crate::types::Credential;

/// Default credential lifetime. Credentials are deliberately short-lived; a
/// ticket may have any number of sequentially issued live credentials, since
/// single use is enforced at validation time, not issuance time.
pub const DEFAULT_TTL: Duration = Duration::seconds(30);

/// Canonical signing payload for a credential (signature field excluded).
/// Timestamps are unix seconds so the payload is transport-independent.
pub fn signing_payload(
    ticket_id: &str,
    event_id: &str,
    tenant_id: &str,
    venue_id: &str,
    nonce: &str,
    issued_at: OffsetDateTime,
    expires_at: OffsetDateTime,
) -> String {
    let mut map = Map::new();
    map.insert("ticket_id".to_string(), json!(ticket_id));
    map.insert("event_id".to_string(), json!(event_id));
    map.insert("tenant_id".to_string(), json!(tenant_id));
    map.insert("venue_id".to_string(), json!(venue_id));
    map.insert("nonce".to_string(), json!(nonce));
    map.insert("issued_at".to_string(), json!(issued_at.unix_timestamp()));
    map.insert("expires_at".to_string(), json!(expires_at.unix_timestamp()));
    Value::Object(map).to_string()
}

/// SHA-256 digest of a canonical payload, as lowercase hex.
pub fn payload_digest(payload: &str) -> String {
    let hash = Sha256::digest(payload.as_bytes());
    format!("{:x}", hash)
}

fn credential_digest(credential: &Credential) -> String {
    payload_digest(&signing_payload(
        &credential.ticket_id,
        &credential.event_id,
        &credential.tenant_id,
        &credential.venue_id,
        &credential.nonce,
        credential.issued_at,
        credential.expires_at,
    ))
}

/// Issue a fresh credential for a ticket.
///
/// Stateless: generates a new nonce, stamps `[now, now + ttl]`, and signs with
/// the tenant's key. Fails only when the tenant has no signing key.
pub fn issue(
    ticket_id: &str,
    event_id: &str,
    tenant_id: &str,
    venue_id: &str,
    ttl: Duration,
    keys: &dyn KeyProvider,
) -> Result<Credential, SigningError> {
    let nonce = ids::new_nonce();
    let issued_at = OffsetDateTime::now_utc();
    let expires_at = issued_at + ttl;

    let payload = signing_payload(
        ticket_id, event_id, tenant_id, venue_id, &nonce, issued_at, expires_at,
    );
    let digest = payload_digest(&payload);
    let signature = keys.sign(digest.as_bytes(), tenant_id)?;

    Ok(Credential {
        ticket_id: ticket_id.to_string(),
        event_id: event_id.to_string(),
        tenant_id: tenant_id.to_string(),
        venue_id: venue_id.to_string(),
        nonce,
        issued_at,
        expires_at,
        signature,
    })
}

/// Verify a credential's signature against the key of the tenant it claims.
///
/// Returns `Ok(false)` for any mismatch, including an unknown claimed tenant:
/// a credential we cannot attribute to a key is indistinguishable from a
/// forgery and must fail closed.
pub fn verify_signature(credential: &Credential, keys: &dyn KeyProvider) -> bool {
    let digest = credential_digest(credential);
    match keys.verify(digest.as_bytes(), &credential.signature, &credential.tenant_id) {
        Ok(valid) => valid,
        Err(SigningError::SigningUnavailable { .. }) => false,
        Err(SigningError::InvalidMaterial(_)) => false,
    }
}
