//! The device-local validator.
//!
//! Runs the shared decision pipeline against a cached manifest instead of the
//! authoritative store. The substitutions are exactly the lookups:
//!
//! - ticket state comes from manifest membership plus the device's own
//!   admission history (a ticket admitted this session reads as Used)
//! - the nonce ledger is an in-process set seeded empty at manifest load
//! - the duplicate guard and admission count use the local log only
//!
//! Plain in-process collections are acceptable here and only here: a device
//! contends only with itself, so a mutex around local state is the entire
//! concurrency story. Every attempt is appended to the device log for later
//! upload.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use time::{Duration, OffsetDateTime};
use tracing::info;
use turnstile_core::{
    keys::encode_verifying_key, validate, Credential, DecisionLookup, DeviceBinding, InfraError,
    KeyProvider, OfflineManifest, PolicySet, ScanAttempt, ScanMode, ScanOutcome, ScanRequest,
    SigningError, TicketStatus, TicketView, ValidatorConfig,
};

use crate::error::OfflineError;
use crate::log::{export_batch, ScanLogFile, SignedLogBatch};
use crate::manifest::verify_manifest;

/// Verify-only key provider carried by a device.
///
/// Devices hold tenant verifying keys, never signing keys; any attempt to
/// sign through this store is `SigningUnavailable`.
#[derive(Debug, Default)]
pub struct DeviceTrustStore {
    keys: BTreeMap<String, VerifyingKey>,
}

impl DeviceTrustStore {
    pub fn new() -> Self {
        DeviceTrustStore::default()
    }

    pub fn with_tenant(mut self, tenant_id: &str, key: VerifyingKey) -> Self {
        self.keys.insert(tenant_id.to_string(), key);
        self
    }
}

impl KeyProvider for DeviceTrustStore {
    fn sign(&self, _payload: &[u8], tenant_id: &str) -> Result<String, SigningError> {
        Err(SigningError::SigningUnavailable {
            tenant_id: tenant_id.to_string(),
        })
    }

    fn verify(
        &self,
        payload: &[u8],
        signature_b64: &str,
        tenant_id: &str,
    ) -> Result<bool, SigningError> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        use ed25519_dalek::Verifier as _;

        let key = self
            .keys
            .get(tenant_id)
            .ok_or_else(|| SigningError::SigningUnavailable {
                tenant_id: tenant_id.to_string(),
            })?;
        let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
            return Ok(false);
        };
        let sig_arr: [u8; 64] = match sig_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return Ok(false),
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_arr);
        Ok(key.verify(payload, &signature).is_ok())
    }

    fn verifying_key(&self, tenant_id: &str) -> Result<VerifyingKey, SigningError> {
        self.keys
            .get(tenant_id)
            .copied()
            .ok_or_else(|| SigningError::SigningUnavailable {
                tenant_id: tenant_id.to_string(),
            })
    }
}

#[derive(Debug, Default)]
struct LocalState {
    /// Nonces seen this session. Seeded empty at manifest load; the session
    /// is bounded, so entries never need to expire.
    nonces: BTreeSet<String>,
    /// ticket id -> last guard mark, for the re-entry window.
    reentry: BTreeMap<String, OffsetDateTime>,
    /// ticket id -> scan id of the local admission.
    admitted: BTreeMap<String, String>,
    /// Allow count from the local log only (conservative for max-admissions).
    allows: u64,
}

/// Offline admission validator for one device and one event.
#[derive(Debug)]
pub struct OfflineValidator {
    manifest: OfflineManifest,
    binding: DeviceBinding,
    trust: DeviceTrustStore,
    rules: PolicySet,
    config: ValidatorConfig,
    log: ScanLogFile,
    local: Mutex<LocalState>,
}

impl OfflineValidator {
    /// Load a manifest for offline duty.
    ///
    /// The manifest signature is verified against the tenant key in the
    /// device's trust store before anything is accepted; the local nonce set
    /// starts empty and the device log is reused as-is (it may already hold
    /// attempts from an earlier session against an older manifest version).
    pub fn load(
        manifest: OfflineManifest,
        binding: DeviceBinding,
        trust: DeviceTrustStore,
        rules: PolicySet,
        log: ScanLogFile,
    ) -> Result<Self, OfflineError> {
        let tenant_key = trust
            .verifying_key(&manifest.tenant_id)
            .map_err(|_| {
                OfflineError::ManifestInvalid(format!(
                    "no trusted key for tenant '{}'",
                    manifest.tenant_id
                ))
            })?;
        verify_manifest(&manifest, &tenant_key)?;

        // Rebuild the local admission history from the persisted log so a
        // device app restart does not forget who it already admitted.
        let mut state = LocalState::default();
        for attempt in log.load()? {
            if attempt.result == turnstile_core::ScanResult::Allow {
                state.admitted.insert(attempt.ticket_id.clone(), attempt.id.clone());
                state.reentry.insert(attempt.ticket_id.clone(), attempt.timestamp);
                state.allows += 1;
            }
        }

        info!(
            event_id = %manifest.event_id,
            version = manifest.version,
            device_id = %binding.device_id,
            tickets = manifest.valid_ticket_ids.len(),
            "offline manifest loaded"
        );
        Ok(OfflineValidator {
            manifest,
            binding,
            trust,
            rules,
            config: ValidatorConfig::default(),
            log,
            local: Mutex::new(state),
        })
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn manifest(&self) -> &OfflineManifest {
        &self.manifest
    }

    /// Validate one presented credential against the cached manifest.
    pub async fn scan(&self, staff_user_id: &str, credential: Credential) -> ScanOutcome {
        let request = ScanRequest {
            device_id: self.binding.device_id.clone(),
            staff_user_id: staff_user_id.to_string(),
            credential,
            mode: ScanMode::Offline,
            deadline: None,
        };
        validate(
            &request,
            &self.binding,
            self,
            &self.trust,
            &self.rules,
            &self.config,
        )
        .await
    }

    /// Sign this device's logged attempts for upload after reconnect.
    pub fn export(&self, device_key: &SigningKey) -> Result<SignedLogBatch, OfflineError> {
        export_batch(
            &self.binding.device_id,
            &self.manifest.event_id,
            self.log.load()?,
            device_key,
        )
    }

    /// The batch verifying key an upload of this device's log will be
    /// checked against server-side.
    pub fn batch_verifying_key(device_key: &SigningKey) -> String {
        encode_verifying_key(&device_key.verifying_key())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LocalState>, InfraError> {
        self.local
            .lock()
            .map_err(|_| InfraError::Storage("device state mutex poisoned".to_string()))
    }
}

#[async_trait]
impl DecisionLookup for OfflineValidator {
    async fn check_and_mark_nonce(&self, nonce: &str, _ttl: Duration) -> Result<bool, InfraError> {
        let mut state = self.lock()?;
        Ok(state.nonces.insert(nonce.to_string()))
    }

    async fn ticket_state(&self, ticket_id: &str) -> Result<Option<TicketView>, InfraError> {
        let state = self.lock()?;
        // Locally admitted beats manifest membership: the snapshot predates
        // this session's own decisions.
        let status = if state.admitted.contains_key(ticket_id) {
            TicketStatus::Used
        } else if self.manifest.valid_ticket_ids.contains(ticket_id) {
            TicketStatus::Valid
        } else {
            // Conservative deny: absent from the snapshot reads as unknown,
            // even if the ticket was issued after generated_at. The false
            // deny is surfaced at reconciliation.
            return Ok(None);
        };
        Ok(Some(TicketView {
            ticket_id: ticket_id.to_string(),
            event_id: self.manifest.event_id.clone(),
            tenant_id: self.manifest.tenant_id.clone(),
            venue_id: self.manifest.venue_id.clone(),
            status,
        }))
    }

    async fn check_and_mark_reentry(
        &self,
        ticket_id: &str,
        window: Duration,
    ) -> Result<bool, InfraError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock()?;
        let first = match state.reentry.get(ticket_id) {
            Some(last) => now - *last > window,
            None => true,
        };
        state.reentry.insert(ticket_id.to_string(), now);
        Ok(first)
    }

    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        _at: OffsetDateTime,
    ) -> Result<bool, InfraError> {
        let mut state = self.lock()?;
        if state.admitted.contains_key(ticket_id) {
            return Ok(false);
        }
        state
            .admitted
            .insert(ticket_id.to_string(), scan_id.to_string());
        state.allows += 1;
        Ok(true)
    }

    async fn admission_count(&self, _event_id: &str) -> Result<u64, InfraError> {
        let state = self.lock()?;
        Ok(state.allows)
    }

    async fn append_attempt(&self, attempt: &ScanAttempt) -> Result<(), InfraError> {
        self.log
            .append(attempt)
            .map_err(|e| InfraError::Storage(format!("device log append: {e}")))
    }
}
