//! In-memory reference backend.
//!
//! A single mutex around the whole state makes every trait method one atomic
//! operation, which is the contract production backends provide with
//! `SET NX` / conditional UPDATE. Used by tests, the CLI, and single-process
//! deployments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use turnstile_core::{
    OfflineManifest, ReconciliationRecord, ScanAttempt, ScanResult, Ticket, TicketStatus,
};

use crate::error::StorageError;
use crate::traits::ScanStorage;

#[derive(Default)]
struct Inner {
    /// key -> expiry. Expired entries are evicted lazily on access.
    marks: BTreeMap<String, OffsetDateTime>,
    tickets: BTreeMap<String, Ticket>,
    attempts: Vec<ScanAttempt>,
    /// event_id -> manifests in version order.
    manifests: BTreeMap<String, Vec<OfflineManifest>>,
    /// event_id -> scan ids already merged by reconciliation.
    merged: BTreeMap<String, BTreeSet<String>>,
    /// batch_id -> reconciliation record.
    reconciliations: BTreeMap<String, ReconciliationRecord>,
}

/// In-memory [`ScanStorage`].
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory storage mutex poisoned".to_string()))
    }

    /// Serialize the full store for file-backed single-process deployments.
    pub fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let inner = self.lock()?;
        Ok(StorageSnapshot {
            marks: inner
                .marks
                .iter()
                .map(|(k, v)| (k.clone(), v.unix_timestamp()))
                .collect(),
            tickets: inner.tickets.values().cloned().collect(),
            attempts: inner.attempts.clone(),
            manifests: inner.manifests.values().flatten().cloned().collect(),
            merged: inner.merged.clone(),
            reconciliations: inner.reconciliations.values().cloned().collect(),
        })
    }

    /// Restore a store from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Result<Self, StorageError> {
        let mut inner = Inner::default();
        for (key, ts) in snapshot.marks {
            let expires_at = OffsetDateTime::from_unix_timestamp(ts)
                .map_err(|e| StorageError::Backend(format!("bad mark expiry: {e}")))?;
            inner.marks.insert(key, expires_at);
        }
        for ticket in snapshot.tickets {
            inner.tickets.insert(ticket.id.clone(), ticket);
        }
        inner.attempts = snapshot.attempts;
        for manifest in snapshot.manifests {
            inner
                .manifests
                .entry(manifest.event_id.clone())
                .or_default()
                .push(manifest);
        }
        for versions in inner.manifests.values_mut() {
            versions.sort_by_key(|m| m.version);
        }
        inner.merged = snapshot.merged;
        for record in snapshot.reconciliations {
            inner.reconciliations.insert(record.batch_id.clone(), record);
        }
        Ok(MemoryStorage {
            inner: Mutex::new(inner),
        })
    }
}

/// Serialized form of a [`MemoryStorage`]. Mark expiries are unix seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    #[serde(default)]
    pub marks: Vec<(String, i64)>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub attempts: Vec<ScanAttempt>,
    #[serde(default)]
    pub manifests: Vec<OfflineManifest>,
    #[serde(default)]
    pub merged: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub reconciliations: Vec<ReconciliationRecord>,
}

#[async_trait]
impl ScanStorage for MemoryStorage {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.lock()?;
        inner.marks.retain(|_, expires_at| *expires_at > now);
        if inner.marks.contains_key(key) {
            return Ok(false);
        }
        inner.marks.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn insert_ticket(&self, ticket: Ticket) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        if inner.tickets.contains_key(&ticket.id) {
            return Err(StorageError::TicketAlreadyExists {
                ticket_id: ticket.id,
            });
        }
        inner.tickets.insert(ticket.id.clone(), ticket);
        Ok(())
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.tickets.get(ticket_id).cloned())
    }

    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let ticket = inner
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| StorageError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })?;
        if ticket.status != TicketStatus::Valid {
            return Ok(false);
        }
        ticket.status = TicketStatus::Used;
        ticket.used_at = Some(at);
        ticket.used_by_scan_id = Some(scan_id.to_string());
        Ok(true)
    }

    async fn reinstate_ticket(&self, ticket_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let ticket = inner
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| StorageError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })?;
        ticket.status = TicketStatus::Valid;
        ticket.used_at = None;
        ticket.used_by_scan_id = None;
        Ok(())
    }

    async fn void_ticket(&self, ticket_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let ticket = inner
            .tickets
            .get_mut(ticket_id)
            .ok_or_else(|| StorageError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })?;
        ticket.status = TicketStatus::Void;
        ticket.used_at = None;
        ticket.used_by_scan_id = None;
        Ok(())
    }

    async fn valid_ticket_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .tickets
            .values()
            .filter(|t| t.event_id == event_id && t.status == TicketStatus::Valid)
            .map(|t| t.id.clone())
            .collect())
    }

    async fn append_scan_attempt(&self, attempt: &ScanAttempt) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_scan_attempts(&self, event_id: &str) -> Result<Vec<ScanAttempt>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn admission_count(&self, event_id: &str) -> Result<u64, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.event_id == event_id && a.result == ScanResult::Allow)
            .count() as u64)
    }

    async fn put_manifest(&self, manifest: &OfflineManifest) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let versions = inner.manifests.entry(manifest.event_id.clone()).or_default();
        if let Some(latest) = versions.last() {
            if manifest.version <= latest.version {
                return Err(StorageError::ManifestVersionConflict {
                    event_id: manifest.event_id.clone(),
                    version: manifest.version,
                    latest: latest.version,
                });
            }
        }
        versions.push(manifest.clone());
        Ok(())
    }

    async fn latest_manifest(
        &self,
        event_id: &str,
    ) -> Result<Option<OfflineManifest>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .manifests
            .get(event_id)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn merged_scan_ids(&self, event_id: &str) -> Result<BTreeSet<String>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.merged.get(event_id).cloned().unwrap_or_default())
    }

    async fn mark_scans_merged(
        &self,
        event_id: &str,
        scan_ids: &BTreeSet<String>,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner
            .merged
            .entry(event_id.to_string())
            .or_default()
            .extend(scan_ids.iter().cloned());
        Ok(())
    }

    async fn get_reconciliation(
        &self,
        batch_id: &str,
    ) -> Result<Option<ReconciliationRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.reconciliations.get(batch_id).cloned())
    }

    async fn put_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        match inner.reconciliations.get(&record.batch_id) {
            Some(existing) if existing == record => Ok(()),
            Some(_) => Err(StorageError::ReconciliationConflict {
                batch_id: record.batch_id.clone(),
            }),
            None => {
                inner
                    .reconciliations
                    .insert(record.batch_id.clone(), record.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_and_mark_is_single_use_until_expiry() {
        let storage = MemoryStorage::new();
        assert!(storage
            .check_and_mark("nonce:abc", Duration::seconds(30))
            .await
            .unwrap());
        assert!(!storage
            .check_and_mark("nonce:abc", Duration::seconds(30))
            .await
            .unwrap());
        // A different key is unaffected.
        assert!(storage
            .check_and_mark("nonce:def", Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_marks_are_reusable() {
        let storage = MemoryStorage::new();
        assert!(storage
            .check_and_mark("reentry:t-1", Duration::seconds(-1))
            .await
            .unwrap());
        // Already expired at insertion, so the key is free again.
        assert!(storage
            .check_and_mark("reentry:t-1", Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn claim_is_conditional_on_valid() {
        let storage = MemoryStorage::new();
        storage
            .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        assert!(storage.claim_ticket("t-1", "scan-1", now).await.unwrap());
        assert!(!storage.claim_ticket("t-1", "scan-2", now).await.unwrap());

        let ticket = storage.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Used);
        assert_eq!(ticket.used_by_scan_id.as_deref(), Some("scan-1"));
    }

    #[tokio::test]
    async fn reinstate_clears_consumption_fields() {
        let storage = MemoryStorage::new();
        storage
            .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
            .await
            .unwrap();
        storage
            .claim_ticket("t-1", "scan-1", OffsetDateTime::now_utc())
            .await
            .unwrap();

        storage.reinstate_ticket("t-1").await.unwrap();
        let ticket = storage.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Valid);
        assert!(ticket.used_at.is_none() && ticket.used_by_scan_id.is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrips_through_json() {
        let storage = MemoryStorage::new();
        storage
            .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
            .await
            .unwrap();
        storage
            .claim_ticket("t-1", "scan-1", OffsetDateTime::now_utc())
            .await
            .unwrap();
        storage
            .check_and_mark("nonce:abc", Duration::minutes(5))
            .await
            .unwrap();

        let json = serde_json::to_string(&storage.snapshot().unwrap()).unwrap();
        let restored =
            MemoryStorage::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();

        let ticket = restored.get_ticket("t-1").await.unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Used);
        // The nonce mark survived the roundtrip.
        assert!(!restored
            .check_and_mark("nonce:abc", Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn manifest_versions_are_strictly_increasing() {
        let storage = MemoryStorage::new();
        let manifest = |version| OfflineManifest {
            event_id: "ev-1".to_string(),
            tenant_id: "ta".to_string(),
            venue_id: "v1".to_string(),
            generated_at: OffsetDateTime::now_utc(),
            version,
            valid_ticket_ids: BTreeSet::new(),
            signature: String::new(),
        };
        storage.put_manifest(&manifest(1)).await.unwrap();
        storage.put_manifest(&manifest(2)).await.unwrap();
        let err = storage.put_manifest(&manifest(2)).await.unwrap_err();
        assert!(matches!(err, StorageError::ManifestVersionConflict { .. }));

        let latest = storage.latest_manifest("ev-1").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }
}
