//! End-to-end reconciliation scenarios against the in-memory backend.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use time::{Duration, OffsetDateTime};
use turnstile_core::{
    keys::encode_verifying_key, DeviceBinding, OfflineManifest, ReasonCode, ReconciliationRecord,
    ResolutionAction, ScanAttempt, ScanMode, ScanResult, StaticDeviceRegistry, Ticket,
    TicketStatus,
};
use turnstile_offline::{export_batch, SignedLogBatch};
use turnstile_reconcile::{reconcile, ReconcileError};
use turnstile_storage::{MemoryStorage, ScanStorage, StorageError};

const T0: i64 = 1_700_000_000;

fn at(offset_s: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(T0 + offset_s).unwrap()
}

fn attempt(
    id: &str,
    device_id: &str,
    ticket_id: &str,
    offset_s: i64,
    result: ScanResult,
    reason_code: Option<ReasonCode>,
) -> ScanAttempt {
    ScanAttempt {
        id: id.to_string(),
        device_id: device_id.to_string(),
        staff_user_id: format!("staff-{device_id}"),
        ticket_id: ticket_id.to_string(),
        event_id: "ev-1".to_string(),
        tenant_id: "ta".to_string(),
        venue_id: "v1".to_string(),
        timestamp: at(offset_s),
        mode: ScanMode::Offline,
        result,
        reason_code,
        correlation_id: None,
    }
}

struct Rig {
    storage: MemoryStorage,
    registry: StaticDeviceRegistry,
    key_x: SigningKey,
    key_y: SigningKey,
}

async fn rig() -> Rig {
    let storage = MemoryStorage::new();
    for i in 1..=4 {
        storage
            .insert_ticket(Ticket::valid(&format!("t-{i}"), "ev-1", "ta", "v1"))
            .await
            .unwrap();
    }

    let key_x = SigningKey::generate(&mut rand::rngs::OsRng);
    let key_y = SigningKey::generate(&mut rand::rngs::OsRng);
    let binding = |device_id: &str, key: &SigningKey| DeviceBinding {
        device_id: device_id.to_string(),
        tenant_id: "ta".to_string(),
        venue_id: "v1".to_string(),
        batch_verifying_key: Some(encode_verifying_key(&key.verifying_key())),
    };
    let registry = StaticDeviceRegistry::new()
        .with_binding(binding("dev-x", &key_x))
        .with_binding(binding("dev-y", &key_y));
    Rig {
        storage,
        registry,
        key_x,
        key_y,
    }
}

fn batch(device_id: &str, attempts: Vec<ScanAttempt>, key: &SigningKey) -> SignedLogBatch {
    export_batch(device_id, "ev-1", attempts, key).unwrap()
}

#[tokio::test]
async fn earlier_offline_scan_wins_later_one_conflicts() {
    let rig = rig().await;
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let by = batch(
        "dev-y",
        vec![attempt("scan-y1", "dev-y", "t-1", 25, ScanResult::Allow, None)],
        &rig.key_y,
    );

    let record = reconcile("ev-1", &[bx, by], &rig.storage, &rig.registry)
        .await
        .unwrap();

    assert_eq!(record.scans_merged, 2);
    assert_eq!(record.conflicts.len(), 1);
    let conflict = &record.conflicts[0];
    assert_eq!(conflict.winning_scan_id, "scan-x1");
    assert_eq!(conflict.losing_scan_id, "scan-y1");
    assert_eq!(conflict.losing_device_id, "dev-y");
    assert_eq!(conflict.reason_code, ReasonCode::DuplicateScan);
    assert_eq!(conflict.delta_ms, 15_000);

    let ticket = rig.storage.get_ticket("t-1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Used);
    assert_eq!(ticket.used_by_scan_id.as_deref(), Some("scan-x1"));

    assert!(record.resolutions.iter().any(|r| {
        r.ticket_id == "t-1" && r.scan_id == "scan-x1" && r.action == ResolutionAction::AppliedOffline
    }));
}

#[tokio::test]
async fn online_admission_stands_against_earlier_offline_claim() {
    let rig = rig().await;
    // An online scan consumed the ticket while the device was offline, and
    // the online record is already in the authoritative log.
    rig.storage
        .append_scan_attempt(&ScanAttempt {
            mode: ScanMode::Online,
            ..attempt("scan-online", "dev-gate", "t-1", 20, ScanResult::Allow, None)
        })
        .await
        .unwrap();
    rig.storage
        .claim_ticket("t-1", "scan-online", at(20))
        .await
        .unwrap();

    // The offline claim is earlier, but the online effect was already applied
    // and is never unwound.
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 5, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let record = reconcile("ev-1", &[bx], &rig.storage, &rig.registry)
        .await
        .unwrap();

    let ticket = rig.storage.get_ticket("t-1").await.unwrap().unwrap();
    assert_eq!(ticket.used_by_scan_id.as_deref(), Some("scan-online"));

    assert_eq!(record.conflicts.len(), 1);
    assert_eq!(record.conflicts[0].winning_scan_id, "scan-online");
    assert_eq!(record.conflicts[0].losing_scan_id, "scan-x1");
    // Negative delta: the losing offline attempt was earlier than the winner.
    assert_eq!(record.conflicts[0].delta_ms, -15_000);
    assert!(record.resolutions.iter().any(|r| {
        r.scan_id == "scan-online" && r.action == ResolutionAction::ConfirmedOnline
    }));
}

#[tokio::test]
async fn rerunning_the_same_batch_is_byte_identical_and_inert() {
    let rig = rig().await;
    let bx = batch(
        "dev-x",
        vec![
            attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None),
            attempt("scan-x2", "dev-x", "t-2", 12, ScanResult::Allow, None),
        ],
        &rig.key_x,
    );

    let first = reconcile("ev-1", std::slice::from_ref(&bx), &rig.storage, &rig.registry)
        .await
        .unwrap();
    let ticket_after_first = rig.storage.get_ticket("t-1").await.unwrap().unwrap();
    let attempts_after_first = rig.storage.list_scan_attempts("ev-1").await.unwrap().len();

    let second = reconcile("ev-1", &[bx], &rig.storage, &rig.registry)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(
        rig.storage.get_ticket("t-1").await.unwrap().unwrap(),
        ticket_after_first
    );
    assert_eq!(
        rig.storage.list_scan_attempts("ev-1").await.unwrap().len(),
        attempts_after_first
    );
}

#[tokio::test]
async fn duplicate_batch_in_one_upload_counts_once() {
    let rig = rig().await;
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let record = reconcile("ev-1", &[bx.clone(), bx], &rig.storage, &rig.registry)
        .await
        .unwrap();
    assert_eq!(record.scans_merged, 1);
    assert!(record.conflicts.is_empty());
}

#[tokio::test]
async fn later_run_does_not_reflag_already_merged_scans() {
    let rig = rig().await;
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let first = reconcile("ev-1", &[bx], &rig.storage, &rig.registry)
        .await
        .unwrap();
    assert!(first.conflicts.is_empty());

    // A second device's log arrives later with its own claim on the ticket.
    let by = batch(
        "dev-y",
        vec![attempt("scan-y1", "dev-y", "t-1", 30, ScanResult::Allow, None)],
        &rig.key_y,
    );
    let second = reconcile("ev-1", &[by], &rig.storage, &rig.registry)
        .await
        .unwrap();

    assert_eq!(second.scans_merged, 1);
    assert_eq!(second.conflicts.len(), 1);
    assert_eq!(second.conflicts[0].winning_scan_id, "scan-x1");
    assert_eq!(second.conflicts[0].losing_scan_id, "scan-y1");
    // The first run's winner is confirmed, not re-applied.
    assert!(second.resolutions.iter().any(|r| {
        r.scan_id == "scan-x1" && r.action == ResolutionAction::ConfirmedOnline
    }));
}

#[tokio::test]
async fn tampered_batch_rejects_the_whole_run() {
    let rig = rig().await;
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let mut by = batch(
        "dev-y",
        vec![attempt("scan-y1", "dev-y", "t-2", 12, ScanResult::Deny, Some(ReasonCode::Expired))],
        &rig.key_y,
    );
    by.attempts[0].result = ScanResult::Allow;

    let err = reconcile("ev-1", &[bx, by], &rig.storage, &rig.registry)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidBatch { .. }));
    assert_eq!(err.reason_code(), Some(ReasonCode::ManifestOrLogInvalid));

    // Nothing was applied, not even from the honest batch.
    let ticket = rig.storage.get_ticket("t-1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Valid);
    assert!(rig.storage.list_scan_attempts("ev-1").await.unwrap().is_empty());
    assert!(rig.storage.merged_scan_ids("ev-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_from_unregistered_device_is_invalid() {
    let rig = rig().await;
    let ghost_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let bg = batch(
        "dev-ghost",
        vec![attempt("scan-g1", "dev-ghost", "t-1", 10, ScanResult::Allow, None)],
        &ghost_key,
    );
    let err = reconcile("ev-1", &[bg], &rig.storage, &rig.registry)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), Some(ReasonCode::ManifestOrLogInvalid));
}

#[tokio::test]
async fn offline_false_deny_is_reported_not_admitted() {
    let rig = rig().await;
    // The device's manifest predated t-3's issuance, so it denied offline.
    let bx = batch(
        "dev-x",
        vec![attempt(
            "scan-x1",
            "dev-x",
            "t-3",
            10,
            ScanResult::Deny,
            Some(ReasonCode::TicketNotFound),
        )],
        &rig.key_x,
    );
    let record = reconcile("ev-1", &[bx], &rig.storage, &rig.registry)
        .await
        .unwrap();

    assert!(record.conflicts.is_empty());
    assert_eq!(record.resolutions.len(), 1);
    assert_eq!(record.resolutions[0].action, ResolutionAction::FalseDeny);
    assert_eq!(record.resolutions[0].ticket_id, "t-3");

    // Reported, never silently admitted: the ticket stays Valid.
    let ticket = rig.storage.get_ticket("t-3").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Valid);
    assert!(ticket.used_by_scan_id.is_none());
}

#[tokio::test]
async fn events_reconcile_independently() {
    let rig = rig().await;
    rig.storage
        .insert_ticket(Ticket::valid("t-ev2", "ev-2", "ta", "v1"))
        .await
        .unwrap();

    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    reconcile("ev-1", &[bx], &rig.storage, &rig.registry)
        .await
        .unwrap();

    // The other event saw nothing.
    assert!(rig.storage.list_scan_attempts("ev-2").await.unwrap().is_empty());
    assert!(rig.storage.merged_scan_ids("ev-2").await.unwrap().is_empty());
    let ticket = rig.storage.get_ticket("t-ev2").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Valid);
}

/// In-memory backend that fails exactly one ticket read, to simulate an
/// infrastructure fault after attempts were appended but before the run
/// finished.
struct FlakyStorage {
    inner: MemoryStorage,
    fail_next_ticket_read: AtomicBool,
}

impl FlakyStorage {
    fn new(inner: MemoryStorage) -> Self {
        FlakyStorage {
            inner,
            fail_next_ticket_read: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ScanStorage for FlakyStorage {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.inner.check_and_mark(key, ttl).await
    }

    async fn insert_ticket(&self, ticket: Ticket) -> Result<(), StorageError> {
        self.inner.insert_ticket(ticket).await
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StorageError> {
        if self.fail_next_ticket_read.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend("connection reset".to_string()));
        }
        self.inner.get_ticket(ticket_id).await
    }

    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.inner.claim_ticket(ticket_id, scan_id, at).await
    }

    async fn reinstate_ticket(&self, ticket_id: &str) -> Result<(), StorageError> {
        self.inner.reinstate_ticket(ticket_id).await
    }

    async fn void_ticket(&self, ticket_id: &str) -> Result<(), StorageError> {
        self.inner.void_ticket(ticket_id).await
    }

    async fn valid_ticket_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError> {
        self.inner.valid_ticket_ids(event_id).await
    }

    async fn append_scan_attempt(&self, attempt: &ScanAttempt) -> Result<(), StorageError> {
        self.inner.append_scan_attempt(attempt).await
    }

    async fn list_scan_attempts(&self, event_id: &str) -> Result<Vec<ScanAttempt>, StorageError> {
        self.inner.list_scan_attempts(event_id).await
    }

    async fn admission_count(&self, event_id: &str) -> Result<u64, StorageError> {
        self.inner.admission_count(event_id).await
    }

    async fn put_manifest(&self, manifest: &OfflineManifest) -> Result<(), StorageError> {
        self.inner.put_manifest(manifest).await
    }

    async fn latest_manifest(
        &self,
        event_id: &str,
    ) -> Result<Option<OfflineManifest>, StorageError> {
        self.inner.latest_manifest(event_id).await
    }

    async fn merged_scan_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError> {
        self.inner.merged_scan_ids(event_id).await
    }

    async fn mark_scans_merged(
        &self,
        event_id: &str,
        scan_ids: &BTreeSet<String>,
    ) -> Result<(), StorageError> {
        self.inner.mark_scans_merged(event_id, scan_ids).await
    }

    async fn get_reconciliation(
        &self,
        batch_id: &str,
    ) -> Result<Option<ReconciliationRecord>, StorageError> {
        self.inner.get_reconciliation(batch_id).await
    }

    async fn put_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StorageError> {
        self.inner.put_reconciliation(record).await
    }
}

#[tokio::test]
async fn retry_after_mid_run_failure_still_applies_offline_admissions() {
    let rig = rig().await;
    let storage = FlakyStorage::new(rig.storage);
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );

    // The first run dies between appending the attempt and resolving claims:
    // the attempt is in the authoritative log but nothing was merged or
    // recorded.
    storage.fail_next_ticket_read.store(true, Ordering::SeqCst);
    let err = reconcile("ev-1", std::slice::from_ref(&bx), &storage, &rig.registry)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Storage(_)));
    assert_eq!(storage.list_scan_attempts("ev-1").await.unwrap().len(), 1);
    assert!(storage.merged_scan_ids("ev-1").await.unwrap().is_empty());

    // The retry must pick the orphaned attempt back up and finish the run.
    let record = reconcile("ev-1", &[bx], &storage, &rig.registry)
        .await
        .unwrap();

    assert_eq!(record.scans_merged, 1);
    assert!(record.resolutions.iter().any(|r| {
        r.scan_id == "scan-x1" && r.action == ResolutionAction::AppliedOffline
    }));
    let ticket = storage.get_ticket("t-1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Used);
    assert_eq!(ticket.used_by_scan_id.as_deref(), Some("scan-x1"));

    // The attempt was not appended a second time.
    assert_eq!(storage.list_scan_attempts("ev-1").await.unwrap().len(), 1);
    assert_eq!(
        storage.merged_scan_ids("ev-1").await.unwrap(),
        BTreeSet::from(["scan-x1".to_string()])
    );
}

#[tokio::test]
async fn deny_for_ticket_claimed_in_same_run_is_not_a_false_deny() {
    let rig = rig().await;
    // One device admitted the ticket; another, working from a stale manifest,
    // denied it as unknown. The admission consumes the ticket, so the deny is
    // moot, not a false deny.
    let bx = batch(
        "dev-x",
        vec![attempt("scan-x1", "dev-x", "t-1", 10, ScanResult::Allow, None)],
        &rig.key_x,
    );
    let by = batch(
        "dev-y",
        vec![attempt(
            "scan-y1",
            "dev-y",
            "t-1",
            12,
            ScanResult::Deny,
            Some(ReasonCode::TicketNotFound),
        )],
        &rig.key_y,
    );

    let record = reconcile("ev-1", &[bx, by], &rig.storage, &rig.registry)
        .await
        .unwrap();

    assert_eq!(record.resolutions.len(), 1);
    assert_eq!(record.resolutions[0].scan_id, "scan-x1");
    assert_eq!(record.resolutions[0].action, ResolutionAction::AppliedOffline);
    assert!(!record
        .resolutions
        .iter()
        .any(|r| r.action == ResolutionAction::FalseDeny));

    let ticket = rig.storage.get_ticket("t-1").await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Used);
    assert_eq!(ticket.used_by_scan_id.as_deref(), Some("scan-x1"));
}
