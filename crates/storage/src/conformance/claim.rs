//! The conditional Valid -> Used transition, reinstatement, and the
//! `used_by_scan_id` invariant.

use std::future::Future;

use time::OffsetDateTime;
use turnstile_core::{Ticket, TicketStatus};

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
            "claim",
            "claim_sets_used_exactly_once",
            claim_sets_used_exactly_once(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "claim_on_void_ticket_fails",
            claim_on_void_ticket_fails(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "claim_on_missing_ticket_is_not_found",
            claim_on_missing_ticket_is_not_found(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "reinstate_restores_the_invariant",
            reinstate_restores_the_invariant(factory).await,
        ),
    ]
}

async fn claim_sets_used_exactly_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let now = OffsetDateTime::now_utc();
    let won = storage
        .claim_ticket("t-1", "scan-1", now)
        .await
        .map_err(|e| format!("claim: {e}"))?;
    if !won {
        return Err("claim on a Valid ticket failed".to_string());
    }
    let again = storage
        .claim_ticket("t-1", "scan-2", now)
        .await
        .map_err(|e| format!("re-claim: {e}"))?;
    if again {
        return Err("second claim on a Used ticket succeeded".to_string());
    }

    let ticket = storage
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("ticket vanished")?;
    if ticket.status != TicketStatus::Used {
        return Err(format!("expected Used, got {:?}", ticket.status));
    }
    if ticket.used_by_scan_id.as_deref() != Some("scan-1") {
        return Err("used_by_scan_id does not name the winning scan".to_string());
    }
    if ticket.used_at.is_none() {
        return Err("used_at not set on claim".to_string());
    }
    Ok(())
}

async fn claim_on_void_ticket_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .void_ticket("t-1")
        .await
        .map_err(|e| format!("void: {e}"))?;

    let claimed = storage
        .claim_ticket("t-1", "scan-1", OffsetDateTime::now_utc())
        .await
        .map_err(|e| format!("claim: {e}"))?;
    if claimed {
        return Err("claim on a Void ticket succeeded".to_string());
    }
    Ok(())
}

async fn claim_on_missing_ticket_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage
        .claim_ticket("ghost", "scan-1", OffsetDateTime::now_utc())
        .await
    {
        Err(StorageError::TicketNotFound { .. }) => Ok(()),
        Ok(_) => Err("claim on a missing ticket did not error".to_string()),
        Err(e) => Err(format!("wrong error variant: {e}")),
    }
}

async fn reinstate_restores_the_invariant<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .insert_ticket(Ticket::valid("t-1", "ev-1", "ta", "v1"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .claim_ticket("t-1", "scan-1", OffsetDateTime::now_utc())
        .await
        .map_err(|e| format!("claim: {e}"))?;
    storage
        .reinstate_ticket("t-1")
        .await
        .map_err(|e| format!("reinstate: {e}"))?;

    let ticket = storage
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("ticket vanished")?;
    if ticket.status != TicketStatus::Valid {
        return Err(format!("expected Valid after reinstate, got {:?}", ticket.status));
    }
    // used_by_scan_id is set iff status is Used.
    if ticket.used_at.is_some() || ticket.used_by_scan_id.is_some() {
        return Err("reinstate left consumption fields set".to_string());
    }
    Ok(())
}
