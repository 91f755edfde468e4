//! Device-local scan log and signed batch export.
//!
//! The local log is an append-only JSON-lines file, one scan attempt per
//! line, durable across app restarts on the device. On reconnect the device
//! exports its attempts as a [`SignedLogBatch`]: the batch id is the SHA-256
//! of the canonical batch payload, so an identical batch uploaded twice is
//! detectable by id alone, and the device key signs that id.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use turnstile_core::ScanAttempt;

use crate::error::OfflineError;

/// Append-only JSON-lines scan log on the device filesystem.
#[derive(Debug)]
pub struct ScanLogFile {
    path: PathBuf,
}

impl ScanLogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ScanLogFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one attempt. Flushes before returning so a device power loss
    /// costs at most the attempt being written.
    pub fn append(&self, attempt: &ScanAttempt) -> Result<(), OfflineError> {
        let line = serde_json::to_string(attempt)
            .map_err(|e| OfflineError::Corrupt {
                line: 0,
                message: format!("serialize: {e}"),
            })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// Read every attempt in append order. A missing file is an empty log.
    pub fn load(&self) -> Result<Vec<ScanAttempt>, OfflineError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut attempts = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let attempt: ScanAttempt =
                serde_json::from_str(line).map_err(|e| OfflineError::Corrupt {
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            attempts.push(attempt);
        }
        Ok(attempts)
    }
}

/// A batch of offline scan attempts with a device signature over the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogBatch {
    /// SHA-256 of the canonical batch payload; doubles as the idempotence key.
    pub batch_id: String,
    pub device_id: String,
    pub event_id: String,
    pub attempts: Vec<ScanAttempt>,
    /// Base64 Ed25519 signature by the device key over the batch id.
    pub signature: String,
}

fn batch_payload(
    device_id: &str,
    event_id: &str,
    attempts: &[ScanAttempt],
) -> Result<String, OfflineError> {
    let attempts_value = serde_json::to_value(attempts).map_err(|e| OfflineError::Corrupt {
        line: 0,
        message: format!("serialize attempts: {e}"),
    })?;
    let mut map = Map::new();
    map.insert("device_id".to_string(), json!(device_id));
    map.insert("event_id".to_string(), json!(event_id));
    map.insert("attempts".to_string(), attempts_value);
    Ok(Value::Object(map).to_string())
}

/// Sign a device's offline attempts for upload.
pub fn export_batch(
    device_id: &str,
    event_id: &str,
    attempts: Vec<ScanAttempt>,
    device_key: &SigningKey,
) -> Result<SignedLogBatch, OfflineError> {
    let payload = batch_payload(device_id, event_id, &attempts)?;
    let batch_id = format!("{:x}", Sha256::digest(payload.as_bytes()));
    let signature = BASE64.encode(device_key.sign(batch_id.as_bytes()).to_bytes());
    Ok(SignedLogBatch {
        batch_id,
        device_id: device_id.to_string(),
        event_id: event_id.to_string(),
        attempts,
        signature,
    })
}

/// Verify a batch's id and device signature. Any failure rejects the batch
/// wholesale; there is no partial acceptance.
pub fn verify_batch(batch: &SignedLogBatch, device_key: &VerifyingKey) -> Result<(), OfflineError> {
    let payload = batch_payload(&batch.device_id, &batch.event_id, &batch.attempts)?;
    let expected_id = format!("{:x}", Sha256::digest(payload.as_bytes()));
    if expected_id != batch.batch_id {
        return Err(OfflineError::LogInvalid("batch id mismatch".to_string()));
    }

    let sig_bytes = BASE64
        .decode(&batch.signature)
        .map_err(|e| OfflineError::LogInvalid(format!("bad signature encoding: {e}")))?;
    let sig_arr: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| OfflineError::LogInvalid("bad signature length".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_arr);
    device_key
        .verify(batch.batch_id.as_bytes(), &signature)
        .map_err(|_| OfflineError::LogInvalid("device signature mismatch".to_string()))
}
