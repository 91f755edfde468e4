//! The reconciliation algorithm.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, warn};
use turnstile_core::{
    keys::decode_verifying_key, DeviceRegistry, ReasonCode, ReconciliationRecord,
    ResolutionAction, ScanAttempt, ScanConflict, ScanResolution, ScanResult, Ticket,
    TicketStatus,
};
use turnstile_offline::{verify_batch, SignedLogBatch};
use turnstile_storage::{ScanStorage, StorageError};

/// Failures that abort a reconciliation run before anything is applied.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A batch failed signature or structural verification and was rejected
    /// wholesale. Surfaced to the uploader as `ManifestOrLogInvalid`.
    #[error("rejected log batch {batch_id}: {message}")]
    InvalidBatch { batch_id: String, message: String },

    /// The authoritative store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The device registry failed to answer.
    #[error("collaborator unavailable: {0}")]
    Collaborator(String),
}

impl ReconcileError {
    /// Reason code to report to the uploading device, if this is a business
    /// rejection rather than an infrastructure failure.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            ReconcileError::InvalidBatch { .. } => Some(ReasonCode::ManifestOrLogInvalid),
            _ => None,
        }
    }
}

/// Deterministic identity of one reconciliation run: the event plus the
/// sorted set of uploaded batch ids.
fn run_batch_id(event_id: &str, batch_ids: &BTreeSet<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    for id in batch_ids {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn sort_key(attempt: &ScanAttempt) -> (OffsetDateTime, String, String) {
    (
        attempt.timestamp,
        attempt.device_id.clone(),
        attempt.id.clone(),
    )
}

/// Merge uploaded offline logs with the event's online scan history.
///
/// Every batch is verified against its device's registered key before any
/// state changes; one bad batch rejects the whole run. On success the new
/// offline attempts are appended to the authoritative scan log, competing
/// claims are resolved in `(timestamp, device_id, scan_id)` order, tickets
/// are finalized, and the run's record is persisted under its batch identity.
pub async fn reconcile<S: ScanStorage>(
    event_id: &str,
    batches: &[SignedLogBatch],
    storage: &S,
    registry: &dyn DeviceRegistry,
) -> Result<ReconciliationRecord, ReconcileError> {
    // A batch uploaded twice in one call is one batch.
    let mut unique: BTreeMap<&str, &SignedLogBatch> = BTreeMap::new();
    for batch in batches {
        unique.insert(&batch.batch_id, batch);
    }
    let batch_id = run_batch_id(event_id, &unique.keys().copied().collect());

    // Idempotence fast path: this exact input was already reconciled.
    if let Some(existing) = storage.get_reconciliation(&batch_id).await? {
        info!(event_id = %event_id, batch_id = %batch_id, "reconciliation replay, returning stored record");
        return Ok(existing);
    }

    // Verify every batch before applying anything from any of them.
    for batch in unique.values() {
        verify_one(event_id, batch, registry).await?;
    }

    let merged = storage.merged_scan_ids(event_id).await?;
    let authoritative = storage.list_scan_attempts(event_id).await?;

    // New offline attempts: not merged by a completed earlier run,
    // deduplicated across batches by scan id. The merged set, not the raw
    // log, is the idempotence gate: a run that failed after appending but
    // before finishing leaves its attempts in the log unmerged, and the
    // retry must still resolve them.
    let mut new_attempts: BTreeMap<String, ScanAttempt> = BTreeMap::new();
    for batch in unique.values() {
        for attempt in &batch.attempts {
            if merged.contains(&attempt.id) {
                continue;
            }
            new_attempts.insert(attempt.id.clone(), attempt.clone());
        }
    }

    // The uploaded attempts become part of the authoritative audit log,
    // skipping any a failed earlier run already appended.
    let to_append: BTreeSet<String> = {
        let known: BTreeSet<&str> = authoritative.iter().map(|a| a.id.as_str()).collect();
        new_attempts
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect()
    };
    for id in &to_append {
        storage.append_scan_attempt(&new_attempts[id]).await?;
    }

    let mut all: Vec<ScanAttempt> = authoritative;
    all.extend(to_append.iter().map(|id| new_attempts[id].clone()));
    all.sort_by_key(sort_key);

    let outcome = resolve(event_id, &all, &new_attempts, storage).await?;

    let record = ReconciliationRecord {
        batch_id: batch_id.clone(),
        event_id: event_id.to_string(),
        scans_merged: new_attempts.len() as u64,
        conflicts: outcome.conflicts,
        resolutions: outcome.resolutions,
        completed_at: OffsetDateTime::now_utc(),
    };

    let new_ids: BTreeSet<String> = new_attempts.keys().cloned().collect();
    storage.mark_scans_merged(event_id, &new_ids).await?;
    storage.put_reconciliation(&record).await?;

    info!(
        event_id = %event_id,
        batch_id = %batch_id,
        scans_merged = record.scans_merged,
        conflicts = record.conflicts.len(),
        "reconciliation complete"
    );
    Ok(record)
}

async fn verify_one(
    event_id: &str,
    batch: &SignedLogBatch,
    registry: &dyn DeviceRegistry,
) -> Result<(), ReconcileError> {
    let invalid = |message: String| ReconcileError::InvalidBatch {
        batch_id: batch.batch_id.clone(),
        message,
    };

    if batch.event_id != event_id {
        return Err(invalid(format!(
            "batch is for event '{}', not '{event_id}'",
            batch.event_id
        )));
    }
    let binding = registry
        .get_binding(&batch.device_id)
        .await
        .map_err(|e| ReconcileError::Collaborator(e.to_string()))?
        .ok_or_else(|| invalid(format!("unknown device '{}'", batch.device_id)))?;
    let key_b64 = binding
        .batch_verifying_key
        .as_deref()
        .ok_or_else(|| invalid(format!("device '{}' has no batch key", batch.device_id)))?;
    let key = decode_verifying_key(key_b64).map_err(|e| invalid(e.to_string()))?;
    verify_batch(batch, &key).map_err(|e| invalid(e.to_string()))?;

    for attempt in &batch.attempts {
        if attempt.event_id != event_id || attempt.device_id != batch.device_id {
            return Err(invalid(format!(
                "attempt '{}' does not belong to this batch",
                attempt.id
            )));
        }
    }
    Ok(())
}

struct ResolveOutcome {
    conflicts: Vec<ScanConflict>,
    resolutions: Vec<ScanResolution>,
}

/// Replay admission claims per ticket in deterministic order.
///
/// Only newly merged attempts produce resolutions or conflicts; attempts
/// merged by earlier runs were flagged then and stay flagged exactly once.
async fn resolve<S: ScanStorage>(
    event_id: &str,
    all: &[ScanAttempt],
    new_attempts: &BTreeMap<String, ScanAttempt>,
    storage: &S,
) -> Result<ResolveOutcome, ReconcileError> {
    let mut conflicts = Vec::new();
    let mut resolutions = Vec::new();

    let mut tickets: BTreeSet<&str> = BTreeSet::new();
    for attempt in new_attempts.values() {
        tickets.insert(&attempt.ticket_id);
    }

    for ticket_id in tickets {
        let ordered: Vec<&ScanAttempt> = all
            .iter()
            .filter(|a| a.ticket_id == ticket_id)
            .collect();
        let new_allows: Vec<&ScanAttempt> = ordered
            .iter()
            .copied()
            .filter(|a| a.result == ScanResult::Allow && new_attempts.contains_key(&a.id))
            .collect();

        let ticket = storage.get_ticket(ticket_id).await?;

        // Pick the authoritative admission for this ticket, if any.
        let winner: Option<(String, ResolutionAction)> = match &ticket {
            Some(Ticket {
                used_by_scan_id: Some(scan_id),
                ..
            }) => {
                // Already consumed by an online decision (or an earlier
                // run); that admission stands.
                Some((scan_id.clone(), ResolutionAction::ConfirmedOnline))
            }
            Some(t) if t.status == TicketStatus::Valid => match new_allows.first() {
                Some(first) => {
                    let claimed = storage
                        .claim_ticket(ticket_id, &first.id, first.timestamp)
                        .await?;
                    if !claimed {
                        // Single-writer-per-event is the caller's contract;
                        // losing this claim means it was violated.
                        warn!(event_id = %event_id, ticket_id = %ticket_id,
                            "concurrent ticket claim during reconciliation");
                    }
                    Some((first.id.clone(), ResolutionAction::AppliedOffline))
                }
                None => None,
            },
            _ => {
                if !new_allows.is_empty() {
                    // An offline admission for a ticket the authority never
                    // issued (or voided). The batch signature was valid, so
                    // this is an operational incident, not noise.
                    warn!(event_id = %event_id, ticket_id = %ticket_id,
                        "offline admission for unknown or void ticket");
                }
                None
            }
        };

        let admitted = winner.is_some();
        if let Some((winning_scan_id, action)) = winner {
            let winning_ts = ordered
                .iter()
                .find(|a| a.id == winning_scan_id)
                .map(|a| a.timestamp)
                .or_else(|| ticket.as_ref().and_then(|t| t.used_at));
            resolutions.push(ScanResolution {
                ticket_id: ticket_id.to_string(),
                scan_id: winning_scan_id.clone(),
                action,
            });
            for loser in new_allows.iter().filter(|a| a.id != winning_scan_id) {
                let delta_ms = winning_ts
                    .map(|ts| (loser.timestamp - ts).whole_milliseconds() as i64)
                    .unwrap_or(0);
                conflicts.push(ScanConflict {
                    ticket_id: ticket_id.to_string(),
                    winning_scan_id: winning_scan_id.clone(),
                    losing_scan_id: loser.id.clone(),
                    losing_device_id: loser.device_id.clone(),
                    losing_staff_user_id: loser.staff_user_id.clone(),
                    reason_code: ReasonCode::DuplicateScan,
                    delta_ms,
                });
            }
        }

        // Offline false-denies at the staleness boundary: denied as unknown
        // on the device but valid (and still unconsumed) authoritatively.
        // Reported for review, never retroactively admitted. A ticket this
        // run just claimed for a winner is consumed, not falsely denied,
        // even though the snapshot above predates the claim.
        for attempt in ordered.iter().filter(|a| {
            new_attempts.contains_key(&a.id)
                && a.result == ScanResult::Deny
                && a.reason_code == Some(ReasonCode::TicketNotFound)
        }) {
            if !admitted && matches!(&ticket, Some(t) if t.status == TicketStatus::Valid) {
                resolutions.push(ScanResolution {
                    ticket_id: ticket_id.to_string(),
                    scan_id: attempt.id.clone(),
                    action: ResolutionAction::FalseDeny,
                });
            }
        }
    }

    conflicts.sort_by(|a, b| {
        (&a.ticket_id, &a.losing_scan_id).cmp(&(&b.ticket_id, &b.losing_scan_id))
    });
    resolutions.sort_by(|a, b| (&a.ticket_id, &a.scan_id).cmp(&(&b.ticket_id, &b.scan_id)));
    Ok(ResolveOutcome {
        conflicts,
        resolutions,
    })
}
