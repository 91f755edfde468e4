//! The admission decision pipeline.
//!
//! [`validate`] runs a fixed, short-circuiting check order:
//!
//! 1. signature  2. freshness  3. nonce replay  4. tenant/venue isolation
//! 5. ticket existence & state  6. duplicate-scan guard  7. policy
//! 8. conditional ticket consumption
//!
//! The order is a contract: reordering changes observable behavior (which
//! reason code a doubly-bad scan gets, whether a nonce is consumed) and must
//! not be done silently.
//!
//! The pipeline suspends only at [`DecisionLookup`] calls. Every scan attempt
//! -- ALLOW, DENY, REVIEW, or infrastructure error -- appends exactly one
//! [`ScanAttempt`] audit record.

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::credential;
use crate::error::{InfraError, ReasonCode};
use crate::ids;
use crate::keys::KeyProvider;
use crate::policy::PolicySet;
use crate::registry::DeviceBinding;
use crate::types::{
    Decision, GateSignal, ScanAttempt, ScanOutcome, ScanRequest, ScanResult, TicketStatus,
    TicketSummary,
};

/// Tunables for the pipeline. Defaults match production settings.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Allowance for device/server clock drift on the freshness window.
    pub clock_skew: Duration,
    /// Duplicate-scan guard window, keyed by ticket id independently of the
    /// nonce. Catches re-presentation via a freshly regenerated credential.
    pub reentry_window: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            clock_skew: Duration::seconds(5),
            reentry_window: Duration::minutes(5),
        }
    }
}

/// Ticket state as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketView {
    pub ticket_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    pub status: TicketStatus,
}

/// The lookup abstraction behind the pipeline.
///
/// The online path implements this against the shared backing store (the only
/// cross-request synchronization mechanism); the offline path implements it
/// against a cached manifest plus device-local state. Both `check_and_mark_*`
/// methods and `claim_ticket` must be atomic in the backing store -- a
/// read-then-write here is a double-admission bug.
#[async_trait]
pub trait DecisionLookup: Send + Sync {
    /// Atomically mark a nonce as seen. Returns false if already marked.
    async fn check_and_mark_nonce(&self, nonce: &str, ttl: Duration) -> Result<bool, InfraError>;

    /// Current state of a ticket, or None if unknown.
    async fn ticket_state(&self, ticket_id: &str) -> Result<Option<TicketView>, InfraError>;

    /// Atomically mark a ticket in the short-window duplicate guard.
    /// Returns false if the ticket was marked within the window.
    async fn check_and_mark_reentry(
        &self,
        ticket_id: &str,
        window: Duration,
    ) -> Result<bool, InfraError>;

    /// Conditionally consume the ticket: set Used only if currently Valid.
    /// Returns false if the ticket was not Valid (lost a race).
    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, InfraError>;

    /// Number of admissions recorded for an event so far.
    async fn admission_count(&self, event_id: &str) -> Result<u64, InfraError>;

    /// Append one audit record. Must never drop records on success.
    async fn append_attempt(&self, attempt: &ScanAttempt) -> Result<(), InfraError>;
}

/// Run the full pipeline for one scan attempt and record the outcome.
pub async fn validate(
    request: &ScanRequest,
    binding: &DeviceBinding,
    lookup: &dyn DecisionLookup,
    keys: &dyn KeyProvider,
    rules: &PolicySet,
    config: &ValidatorConfig,
) -> ScanOutcome {
    let scan_id = ids::new_scan_id();

    match run_checks(request, binding, lookup, keys, rules, config, &scan_id).await {
        Ok((decision, ticket)) => {
            let (result, reason) = match &decision {
                Decision::Allow => (ScanResult::Allow, None),
                Decision::Deny(code) => (ScanResult::Deny, Some(*code)),
                Decision::Review(code) => (ScanResult::Review, Some(*code)),
            };
            let attempt = build_attempt(request, &scan_id, result, reason, None);

            match reason {
                Some(ReasonCode::TenantMismatch) => warn!(
                    scan_id = %scan_id,
                    device_id = %request.device_id,
                    credential_tenant = %request.credential.tenant_id,
                    device_tenant = %binding.tenant_id,
                    "cross-tenant credential presented"
                ),
                _ => info!(
                    scan_id = %scan_id,
                    ticket_id = %request.credential.ticket_id,
                    result = ?result,
                    reason = reason.map(|r| r.as_str()).unwrap_or("-"),
                    "scan decided"
                ),
            }

            if let Err(e) = lookup.append_attempt(&attempt).await {
                // A denial with no audit record is not a decision we can
                // stand behind; fail closed. An admission, however, has
                // already consumed the ticket -- surface the audit gap
                // loudly but do not strand the entrant at the gate.
                if matches!(decision, Decision::Allow) {
                    error!(scan_id = %scan_id, error = %e, "audit append failed after admission");
                } else {
                    let correlation_id = ids::new_correlation_id();
                    warn!(scan_id = %scan_id, correlation_id = %correlation_id, error = %e,
                        "audit append failed; converting to retry");
                    return ScanOutcome {
                        scan_id,
                        signal: GateSignal::Retry { correlation_id },
                        ticket: None,
                    };
                }
            }

            ScanOutcome {
                scan_id,
                signal: decision.into(),
                ticket,
            }
        }
        Err(infra) => {
            let correlation_id = ids::new_correlation_id();
            warn!(
                scan_id = %scan_id,
                correlation_id = %correlation_id,
                error = %infra,
                "scan undecidable due to infrastructure failure"
            );
            let attempt = build_attempt(
                request,
                &scan_id,
                ScanResult::Error,
                None,
                Some(correlation_id.clone()),
            );
            if let Err(e) = lookup.append_attempt(&attempt).await {
                error!(scan_id = %scan_id, error = %e, "audit append failed for error attempt");
            }
            ScanOutcome {
                scan_id,
                signal: GateSignal::Retry { correlation_id },
                ticket: None,
            }
        }
    }
}

async fn run_checks(
    request: &ScanRequest,
    binding: &DeviceBinding,
    lookup: &dyn DecisionLookup,
    keys: &dyn KeyProvider,
    rules: &PolicySet,
    config: &ValidatorConfig,
    scan_id: &str,
) -> Result<(Decision, Option<TicketSummary>), InfraError> {
    let cred = &request.credential;

    // 1. Signature, against the key of the tenant the credential claims.
    if !credential::verify_signature(cred, keys) {
        return Ok((Decision::Deny(ReasonCode::InvalidSignature), None));
    }

    // 2. Freshness, with clock-skew allowance on both ends.
    let now = OffsetDateTime::now_utc();
    if now < cred.issued_at - config.clock_skew || now > cred.expires_at + config.clock_skew {
        return Ok((Decision::Deny(ReasonCode::Expired), None));
    }

    // 3. Nonce replay. The mark outlives the credential so a replay after
    // this scan but before expiry still hits it.
    check_deadline(request)?;
    let nonce_ttl = (cred.expires_at - now) + config.clock_skew;
    if !lookup.check_and_mark_nonce(&cred.nonce, nonce_ttl).await? {
        return Ok((Decision::Deny(ReasonCode::NonceReplay), None));
    }

    // 4. Isolation: the device's registered binding is authoritative.
    if binding.tenant_id != cred.tenant_id {
        return Ok((Decision::Deny(ReasonCode::TenantMismatch), None));
    }
    if binding.venue_id != cred.venue_id {
        return Ok((Decision::Deny(ReasonCode::VenueMismatch), None));
    }

    // 5. Ticket existence & state.
    check_deadline(request)?;
    let ticket = match lookup.ticket_state(&cred.ticket_id).await? {
        Some(t) => t,
        None => return Ok((Decision::Deny(ReasonCode::TicketNotFound), None)),
    };
    if ticket.tenant_id != cred.tenant_id || ticket.event_id != cred.event_id {
        // Credential references a ticket belonging to another tenant or
        // event; reveal nothing about the ticket itself.
        return Ok((Decision::Deny(ReasonCode::TicketNotFound), None));
    }
    let summary = TicketSummary {
        ticket_id: ticket.ticket_id.clone(),
        event_id: ticket.event_id.clone(),
        status: ticket.status,
    };
    match ticket.status {
        TicketStatus::Valid => {}
        TicketStatus::Used => {
            return Ok((Decision::Deny(ReasonCode::DuplicateScan), Some(summary)))
        }
        TicketStatus::Void => {
            // A voided ticket is not admissible and not distinguishable from
            // an unknown one at the gate.
            return Ok((Decision::Deny(ReasonCode::TicketNotFound), Some(summary)));
        }
    }

    // 6. Duplicate-scan guard: second line of defense should the status
    // check above race. The mark is recorded even when re-entry policy
    // permits passing, so the window keeps sliding.
    check_deadline(request)?;
    let first_in_window = lookup
        .check_and_mark_reentry(&cred.ticket_id, config.reentry_window)
        .await?;
    if !first_in_window && !rules.reentry_allowed {
        return Ok((Decision::Deny(ReasonCode::DuplicateScan), Some(summary)));
    }

    // 7. Policy consultation: may only tighten the decision.
    if let Some(max) = rules.max_admissions {
        check_deadline(request)?;
        if lookup.admission_count(&cred.event_id).await? >= max {
            return Ok((Decision::Deny(ReasonCode::PolicyViolation), Some(summary)));
        }
    }
    if rules.require_review {
        // Manual confirmation required; the ticket is not consumed here.
        return Ok((Decision::Review(ReasonCode::PolicyViolation), Some(summary)));
    }

    // 8. Consume the ticket: single conditional update, set Used only if
    // currently Valid. Losing this race is a duplicate, not an error.
    check_deadline(request)?;
    if !lookup.claim_ticket(&cred.ticket_id, scan_id, now).await? {
        return Ok((Decision::Deny(ReasonCode::DuplicateScan), Some(summary)));
    }

    let summary = TicketSummary {
        status: TicketStatus::Used,
        ..summary
    };
    Ok((Decision::Allow, Some(summary)))
}

fn check_deadline(request: &ScanRequest) -> Result<(), InfraError> {
    match request.deadline {
        Some(deadline) if OffsetDateTime::now_utc() > deadline => {
            Err(InfraError::DeadlineExceeded)
        }
        _ => Ok(()),
    }
}

fn build_attempt(
    request: &ScanRequest,
    scan_id: &str,
    result: ScanResult,
    reason_code: Option<ReasonCode>,
    correlation_id: Option<String>,
) -> ScanAttempt {
    ScanAttempt {
        id: scan_id.to_string(),
        device_id: request.device_id.clone(),
        staff_user_id: request.staff_user_id.clone(),
        ticket_id: request.credential.ticket_id.clone(),
        event_id: request.credential.event_id.clone(),
        tenant_id: request.credential.tenant_id.clone(),
        venue_id: request.credential.venue_id.clone(),
        timestamp: OffsetDateTime::now_utc(),
        mode: request.mode,
        result,
        reason_code,
        correlation_id,
    }
}
