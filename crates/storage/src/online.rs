//! Online validation path: the decision pipeline wired to a [`ScanStorage`].

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::{error, warn};
use turnstile_core::{
    ids, validate, DecisionLookup, DeviceRegistry, GateSignal, InfraError, KeyProvider,
    PolicyEngine, ReasonCode, ScanAttempt, ScanOutcome, ScanRequest, ScanResult, TicketView,
    ValidatorConfig,
};

use crate::error::StorageError;
use crate::traits::ScanStorage;

fn infra(e: StorageError) -> InfraError {
    InfraError::Storage(e.to_string())
}

/// [`DecisionLookup`] backed by a shared [`ScanStorage`].
pub struct OnlineLookup<S> {
    storage: Arc<S>,
}

impl<S: ScanStorage> OnlineLookup<S> {
    pub fn new(storage: Arc<S>) -> Self {
        OnlineLookup { storage }
    }
}

#[async_trait]
impl<S: ScanStorage> DecisionLookup for OnlineLookup<S> {
    async fn check_and_mark_nonce(&self, nonce: &str, ttl: Duration) -> Result<bool, InfraError> {
        self.storage
            .check_and_mark(&format!("nonce:{nonce}"), ttl)
            .await
            .map_err(infra)
    }

    async fn ticket_state(&self, ticket_id: &str) -> Result<Option<TicketView>, InfraError> {
        let ticket = self.storage.get_ticket(ticket_id).await.map_err(infra)?;
        Ok(ticket.map(|t| TicketView {
            ticket_id: t.id,
            event_id: t.event_id,
            tenant_id: t.tenant_id,
            venue_id: t.venue_id,
            status: t.status,
        }))
    }

    async fn check_and_mark_reentry(
        &self,
        ticket_id: &str,
        window: Duration,
    ) -> Result<bool, InfraError> {
        self.storage
            .check_and_mark(&format!("reentry:{ticket_id}"), window)
            .await
            .map_err(infra)
    }

    async fn claim_ticket(
        &self,
        ticket_id: &str,
        scan_id: &str,
        at: OffsetDateTime,
    ) -> Result<bool, InfraError> {
        match self.storage.claim_ticket(ticket_id, scan_id, at).await {
            Ok(claimed) => Ok(claimed),
            // Vanished between the state check and the claim: lost the race.
            Err(StorageError::TicketNotFound { .. }) => Ok(false),
            Err(e) => Err(infra(e)),
        }
    }

    async fn admission_count(&self, event_id: &str) -> Result<u64, InfraError> {
        self.storage.admission_count(event_id).await.map_err(infra)
    }

    async fn append_attempt(&self, attempt: &ScanAttempt) -> Result<(), InfraError> {
        self.storage.append_scan_attempt(attempt).await.map_err(infra)
    }
}

/// The online validation service: resolves the device binding and event
/// rules, then runs the shared decision pipeline.
pub struct OnlineValidator<S, R, P> {
    storage: Arc<S>,
    registry: R,
    policy: P,
    keys: Arc<dyn KeyProvider>,
    config: ValidatorConfig,
}

impl<S, R, P> OnlineValidator<S, R, P>
where
    S: ScanStorage,
    R: DeviceRegistry,
    P: PolicyEngine,
{
    pub fn new(storage: Arc<S>, registry: R, policy: P, keys: Arc<dyn KeyProvider>) -> Self {
        OnlineValidator {
            storage,
            registry,
            policy,
            keys,
            config: ValidatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate one scan attempt end to end.
    pub async fn scan(&self, request: &ScanRequest) -> ScanOutcome {
        let lookup = OnlineLookup::new(self.storage.clone());

        let binding = match self.registry.get_binding(&request.device_id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                // An unregistered device has no tenant binding to satisfy the
                // isolation checks; fail closed as a tenant mismatch and flag
                // it as a security event.
                warn!(device_id = %request.device_id, "scan from unregistered device");
                return self
                    .record_shortcut(
                        &lookup,
                        request,
                        ScanResult::Deny,
                        Some(ReasonCode::TenantMismatch),
                    )
                    .await;
            }
            Err(e) => return self.record_infra(&lookup, request, e).await,
        };

        let rules = match self.policy.get_rules(&request.credential.event_id).await {
            Ok(rules) => rules,
            Err(e) => return self.record_infra(&lookup, request, e).await,
        };

        validate(request, &binding, &lookup, self.keys.as_ref(), &rules, &self.config).await
    }

    async fn record_shortcut(
        &self,
        lookup: &OnlineLookup<S>,
        request: &ScanRequest,
        result: ScanResult,
        reason_code: Option<ReasonCode>,
    ) -> ScanOutcome {
        let scan_id = ids::new_scan_id();
        let attempt = attempt_for(request, &scan_id, result, reason_code, None);
        if let Err(e) = lookup.append_attempt(&attempt).await {
            error!(scan_id = %scan_id, error = %e, "audit append failed");
            let correlation_id = ids::new_correlation_id();
            return ScanOutcome {
                scan_id,
                signal: GateSignal::Retry { correlation_id },
                ticket: None,
            };
        }
        let signal = match (result, reason_code) {
            (ScanResult::Deny, Some(reason_code)) => GateSignal::Deny { reason_code },
            (ScanResult::Review, Some(reason_code)) => GateSignal::Review { reason_code },
            _ => GateSignal::Allow,
        };
        ScanOutcome {
            scan_id,
            signal,
            ticket: None,
        }
    }

    async fn record_infra(
        &self,
        lookup: &OnlineLookup<S>,
        request: &ScanRequest,
        infra: InfraError,
    ) -> ScanOutcome {
        let scan_id = ids::new_scan_id();
        let correlation_id = ids::new_correlation_id();
        warn!(
            scan_id = %scan_id,
            correlation_id = %correlation_id,
            error = %infra,
            "scan undecidable before pipeline entry"
        );
        let attempt = attempt_for(
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

fn attempt_for(
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
