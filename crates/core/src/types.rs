use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ReasonCode;

/// A signed, time-boxed, single-use entry credential for one ticket.
///
/// Immutable once issued. The signature is Ed25519 over the SHA-256 digest of
/// the canonical JSON of every other field, keyed by the issuing tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ticket_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    /// Single-use random value; consumed by the nonce ledger at validation.
    pub nonce: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Base64-encoded detached Ed25519 signature.
    pub signature: String,
}

/// Lifecycle state of a ticket. Transitions are monotonic
/// (`Valid -> Used`, `Valid -> Void`) except for an explicit administrative
/// reinstatement, which is a storage-level operation outside the decision path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Valid,
    Used,
    Void,
}

/// The authoritative ticket record.
///
/// Invariant: `used_by_scan_id.is_some()` if and only if `status == Used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    pub status: TicketStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
    pub used_by_scan_id: Option<String>,
}

impl Ticket {
    /// A fresh, admissible ticket.
    pub fn valid(id: &str, event_id: &str, tenant_id: &str, venue_id: &str) -> Self {
        Ticket {
            id: id.to_string(),
            event_id: event_id.to_string(),
            tenant_id: tenant_id.to_string(),
            venue_id: venue_id.to_string(),
            status: TicketStatus::Valid,
            used_at: None,
            used_by_scan_id: None,
        }
    }
}

/// Whether a scan was decided against the authoritative store or a cached
/// manifest on a disconnected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Online,
    Offline,
}

/// Outcome class recorded on a scan attempt. `Error` is an infrastructure
/// failure, never a business denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanResult {
    Allow,
    Deny,
    Review,
    Error,
}

/// Append-only audit record, written exactly once per scan attempt
/// regardless of outcome. Completeness of this log is what makes later
/// reconciliation trustworthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAttempt {
    pub id: String,
    pub device_id: String,
    pub staff_user_id: String,
    pub ticket_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub mode: ScanMode,
    pub result: ScanResult,
    pub reason_code: Option<ReasonCode>,
    /// Set on `Error` results so operators can correlate with server logs.
    pub correlation_id: Option<String>,
}

/// A signed, versioned snapshot of the still-valid ticket ids for one event,
/// distributable to devices expected to go offline.
///
/// Immutable. A newer version supersedes an older one but never retroactively
/// invalidates scans already decided against the older one. `valid_ticket_ids`
/// is non-growing between versions unless an admin reinstatement occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineManifest {
    pub event_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub version: u64,
    pub valid_ticket_ids: BTreeSet<String>,
    /// Base64-encoded detached Ed25519 signature by the tenant key.
    pub signature: String,
}

/// A losing claim on a ticket discovered during reconciliation, linked to the
/// scan that won.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConflict {
    pub ticket_id: String,
    pub winning_scan_id: String,
    pub losing_scan_id: String,
    pub losing_device_id: String,
    pub losing_staff_user_id: String,
    pub reason_code: ReasonCode,
    /// Milliseconds between the winning and losing attempts.
    pub delta_ms: i64,
}

/// How a reconciled scan was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// An online decision had already consumed the ticket; confirmed as-is.
    ConfirmedOnline,
    /// An offline admission became the authoritative consumption.
    AppliedOffline,
    /// Denied offline at the staleness boundary but valid authoritatively;
    /// reported for operational review, never retroactively admitted.
    FalseDeny,
}

/// One reconciled ticket outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResolution {
    pub ticket_id: String,
    pub scan_id: String,
    pub action: ResolutionAction,
}

/// Result of one reconciliation run. Re-running the identical input batch
/// returns the stored record unchanged, byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub batch_id: String,
    pub event_id: String,
    pub scans_merged: u64,
    pub conflicts: Vec<ScanConflict>,
    pub resolutions: Vec<ScanResolution>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

/// A scan attempt as consumed from the API layer.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub device_id: String,
    pub staff_user_id: String,
    pub credential: Credential,
    pub mode: ScanMode,
    /// Fail-closed deadline. Exceeding it yields a RETRY outcome, never an
    /// implicit fallback to offline validation.
    pub deadline: Option<OffsetDateTime>,
}

/// The decision produced by the pipeline for a decidable scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(ReasonCode),
    Review(ReasonCode),
}

/// The three-way gate-facing signal. `Retry` carries a correlation id and is
/// the only outcome for infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GateSignal {
    Allow,
    Deny { reason_code: ReasonCode },
    Review { reason_code: ReasonCode },
    Retry { correlation_id: String },
}

impl From<Decision> for GateSignal {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Allow => GateSignal::Allow,
            Decision::Deny(reason_code) => GateSignal::Deny { reason_code },
            Decision::Review(reason_code) => GateSignal::Review { reason_code },
        }
    }
}

/// Read-only ticket summary returned alongside a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_id: String,
    pub event_id: String,
    pub status: TicketStatus,
}

/// Full response for one scan attempt: the gate signal plus the id of the
/// audit record that was written for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub scan_id: String,
    pub signal: GateSignal,
    pub ticket: Option<TicketSummary>,
}
