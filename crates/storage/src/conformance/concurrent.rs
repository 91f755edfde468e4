//! Real concurrency against the atomic primitives.
//!
//! `tokio::spawn` creates parallel tasks that race against `check_and_mark`
//! and `claim_ticket`; exactly one task may win each race.

use std::future::Future;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use turnstile_core::Ticket;

use super::TestResult;
use crate::traits::ScanStorage;

/// Number of racing tasks per test.
const N: usize = 16;

pub(super) async fn run<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_marks_exactly_one_wins",
            concurrent_marks_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_claims_exactly_one_wins",
            concurrent_claims_exactly_one_wins(factory).await,
        ),
    ]
}

async fn concurrent_marks_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.check_and_mark("nonce:contested", Duration::seconds(60)).await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        let marked = handle
            .await
            .map_err(|e| format!("join: {e}"))?
            .map_err(|e| format!("mark: {e}"))?;
        if marked {
            wins += 1;
        }
    }
    if wins != 1 {
        return Err(format!("expected exactly 1 winning mark, got {wins}"));
    }
    Ok(())
}

async fn concurrent_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    storage
        .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.claim_ticket("t-1", &format!("scan-{i}"), OffsetDateTime::now_utc())
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        let claimed = handle
            .await
            .map_err(|e| format!("join: {e}"))?
            .map_err(|e| format!("claim: {e}"))?;
        if claimed {
            wins += 1;
        }
    }
    if wins != 1 {
        return Err(format!("expected exactly 1 winning claim, got {wins}"));
    }

    // The winner recorded on the ticket must be one of the racing scans.
    let ticket = storage
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("ticket vanished")?;
    let winner = ticket.used_by_scan_id.ok_or("no winning scan recorded")?;
    if !winner.starts_with("scan-") {
        return Err(format!("unexpected winner id: {winner}"));
    }
    Ok(())
}
