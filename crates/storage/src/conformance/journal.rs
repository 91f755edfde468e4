//! Scan-log append order, admission counting, manifest version monotonicity,
//! and merged-scan bookkeeping.

use std::collections::BTreeSet;
use std::future::Future;

use time::OffsetDateTime;
use turnstile_core::{OfflineManifest, ReasonCode, ScanAttempt, ScanMode, ScanResult};

use super::TestResult;
use crate::error::StorageError;
use crate::traits::ScanStorage;

pub(super) async fn run<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "journal",
            "attempts_preserve_append_order",
            attempts_preserve_append_order(factory).await,
        ),
        TestResult::from_result(
            "journal",
            "admission_count_counts_allows_only",
            admission_count_counts_allows_only(factory).await,
        ),
        TestResult::from_result(
            "journal",
            "manifest_versions_monotonic",
            manifest_versions_monotonic(factory).await,
        ),
        TestResult::from_result(
            "journal",
            "merged_ids_accumulate",
            merged_ids_accumulate(factory).await,
        ),
    ]
}

fn attempt(id: &str, event_id: &str, result: ScanResult) -> ScanAttempt {
    ScanAttempt {
        id: id.to_string(),
        device_id: "dev-1".to_string(),
        staff_user_id: "staff-1".to_string(),
        ticket_id: "t-1".to_string(),
        event_id: event_id.to_string(),
        tenant_id: "ta".to_string(),
        venue_id: "v1".to_string(),
        timestamp: OffsetDateTime::now_utc(),
        mode: ScanMode::Online,
        result,
        reason_code: match result {
            ScanResult::Deny => Some(ReasonCode::DuplicateScan),
            _ => None,
        },
        correlation_id: None,
    }
}

async fn attempts_preserve_append_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for id in ["s-1", "s-2", "s-3"] {
        storage
            .append_scan_attempt(&attempt(id, "ev-1", ScanResult::Allow))
            .await
            .map_err(|e| format!("append {id}: {e}"))?;
    }
    // An attempt for a different event must not leak in.
    storage
        .append_scan_attempt(&attempt("s-other", "ev-2", ScanResult::Allow))
        .await
        .map_err(|e| format!("append other: {e}"))?;

    let attempts = storage
        .list_scan_attempts("ev-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = attempts.iter().map(|a| a.id.as_str()).collect();
    if ids != ["s-1", "s-2", "s-3"] {
        return Err(format!("wrong order or filtering: {ids:?}"));
    }
    Ok(())
}

async fn admission_count_counts_allows_only<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .append_scan_attempt(&attempt("s-1", "ev-1", ScanResult::Allow))
        .await
        .map_err(|e| format!("append: {e}"))?;
    storage
        .append_scan_attempt(&attempt("s-2", "ev-1", ScanResult::Deny))
        .await
        .map_err(|e| format!("append: {e}"))?;
    storage
        .append_scan_attempt(&attempt("s-3", "ev-1", ScanResult::Error))
        .await
        .map_err(|e| format!("append: {e}"))?;

    let count = storage
        .admission_count("ev-1")
        .await
        .map_err(|e| format!("count: {e}"))?;
    if count != 1 {
        return Err(format!("expected 1 admission, got {count}"));
    }
    Ok(())
}

async fn manifest_versions_monotonic<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let manifest = |version: u64| OfflineManifest {
        event_id: "ev-1".to_string(),
        tenant_id: "ta".to_string(),
        venue_id: "v1".to_string(),
        generated_at: OffsetDateTime::now_utc(),
        version,
        valid_ticket_ids: BTreeSet::new(),
        signature: String::new(),
    };

    storage
        .put_manifest(&manifest(1))
        .await
        .map_err(|e| format!("put v1: {e}"))?;
    storage
        .put_manifest(&manifest(3))
        .await
        .map_err(|e| format!("put v3: {e}"))?;
    match storage.put_manifest(&manifest(2)).await {
        Err(StorageError::ManifestVersionConflict { .. }) => {}
        Ok(()) => return Err("stale manifest version accepted".to_string()),
        Err(e) => return Err(format!("wrong error variant: {e}")),
    }

    let latest = storage
        .latest_manifest("ev-1")
        .await
        .map_err(|e| format!("latest: {e}"))?
        .ok_or("no manifest stored")?;
    if latest.version != 3 {
        return Err(format!("expected latest version 3, got {}", latest.version));
    }
    Ok(())
}

async fn merged_ids_accumulate<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let first: BTreeSet<String> = ["s-1", "s-2"].iter().map(|s| s.to_string()).collect();
    let second: BTreeSet<String> = ["s-2", "s-3"].iter().map(|s| s.to_string()).collect();

    storage
        .mark_scans_merged("ev-1", &first)
        .await
        .map_err(|e| format!("mark first: {e}"))?;
    storage
        .mark_scans_merged("ev-1", &second)
        .await
        .map_err(|e| format!("mark second: {e}"))?;

    let merged = storage
        .merged_scan_ids("ev-1")
        .await
        .map_err(|e| format!("read: {e}"))?;
    let expected: BTreeSet<String> = ["s-1", "s-2", "s-3"].iter().map(|s| s.to_string()).collect();
    if merged != expected {
        return Err(format!("expected {expected:?}, got {merged:?}"));
    }

    let other = storage
        .merged_scan_ids("ev-2")
        .await
        .map_err(|e| format!("read other: {e}"))?;
    if !other.is_empty() {
        return Err("merged ids leaked across events".to_string());
    }
    Ok(())
}
