use std::collections::BTreeSet;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use turnstile_core::{OfflineManifest, ReconciliationRecord, ScanAttempt, Ticket};

use crate::error::StorageError;

/// The storage trait for online validation backends.
///
/// ## Atomicity
///
/// `check_and_mark` and `claim_ticket` are the synchronization primitives the
/// whole system leans on. Each must be a single atomic operation against the
/// backing store (`SET NX` / `UPDATE ... WHERE status = 'valid'` semantics),
/// never a read followed by a write: two concurrent scans that both observe
/// "unmarked" is exactly the double-admission the validator exists to prevent.
///
/// ## Key namespacing
///
/// `check_and_mark` serves both the nonce ledger and the duplicate-scan
/// guard; callers namespace keys (`nonce:<nonce>`, `reentry:<ticket_id>`).
///
/// ## Thread safety
///
/// Implementations must be `Send + Sync + 'static`; one validation request is
/// one scheduling unit and requests share nothing in process.
#[async_trait]
pub trait ScanStorage: Send + Sync + 'static {
    // ── Nonce ledger / duplicate-scan guard ──────────────────────────────

    /// Atomically mark `key` as seen for `ttl`. Returns true only if the key
    /// was not already present (and unexpired).
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    // ── Tickets ──────────────────────────────────────────────────────────

    /// Insert a ticket record (issuance-side setup).
    async fn insert_ticket(&self, ticket: Ticket) -> Result<(), StorageError>;

    /// Read a ticket by id.
    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StorageError>;

    /// Conditionally consume a ticket: set Used (with `used_at`,
    /// `used_by_scan_id`) only if currently Valid. Returns false when the
    /// ticket was not Valid.
    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, StorageError>;

    /// Administrative reinstatement: reset a Used or Void ticket to Valid and
    /// clear its consumption fields. Not reachable from the decision path.
    async fn reinstate_ticket(&self, ticket_id: &str) -> Result<(), StorageError>;

    /// Administrative void.
    async fn void_ticket(&self, ticket_id: &str) -> Result<(), StorageError>;

    /// Ids of all tickets for an event with status Valid, for manifest
    /// generation. Returned sorted (BTreeSet) for deterministic snapshots.
    async fn valid_ticket_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError>;

    // ── Scan attempt log (append-only) ───────────────────────────────────

    /// Append one audit record. Never overwrites.
    async fn append_scan_attempt(&self, attempt: &ScanAttempt) -> Result<(), StorageError>;

    /// All recorded attempts for an event, in append order.
    async fn list_scan_attempts(&self, event_id: &str) -> Result<Vec<ScanAttempt>, StorageError>;

    /// Number of Allow attempts recorded for an event.
    async fn admission_count(&self, event_id: &str) -> Result<u64, StorageError>;

    // ── Offline manifests ────────────────────────────────────────────────

    /// Store a manifest version. The version must be strictly greater than
    /// the latest stored for the event.
    async fn put_manifest(&self, manifest: &OfflineManifest) -> Result<(), StorageError>;

    /// Latest stored manifest for an event, if any.
    async fn latest_manifest(
        &self,
        event_id: &str,
    ) -> Result<Option<OfflineManifest>, StorageError>;

    // ── Reconciliation bookkeeping ───────────────────────────────────────

    /// Scan ids already merged by past reconciliation runs for an event.
    async fn merged_scan_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Record scan ids as merged so later runs skip them.
    async fn mark_scans_merged(
        &self,
        event_id: &str,
        scan_ids: &BTreeSet<String>,
    ) -> Result<(), StorageError>;

    /// A finished reconciliation record by batch id.
    async fn get_reconciliation(
        &self,
        batch_id: &str,
    ) -> Result<Option<ReconciliationRecord>, StorageError>;

    /// Store a reconciliation record. Re-putting an identical record is a
    /// no-op; a different record under the same batch id is a conflict.
    async fn put_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StorageError>;
}
