use serde::{Deserialize, Serialize};

/// Reason codes attached to DENY and REVIEW outcomes.
///
/// `DuplicateScan` and `NonceReplay` both guard against re-use but are never
/// conflated: the former means the ticket itself was already consumed, the
/// latter means an identical credential payload was presented twice.
/// Likewise `TenantMismatch` (a security event) and `VenueMismatch` (an
/// operational error) stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidSignature,
    Expired,
    NonceReplay,
    DuplicateScan,
    TenantMismatch,
    VenueMismatch,
    TicketNotFound,
    PolicyViolation,
    ManifestOrLogInvalid,
    SigningUnavailable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::InvalidSignature => "invalid_signature",
            ReasonCode::Expired => "expired",
            ReasonCode::NonceReplay => "nonce_replay",
            ReasonCode::DuplicateScan => "duplicate_scan",
            ReasonCode::TenantMismatch => "tenant_mismatch",
            ReasonCode::VenueMismatch => "venue_mismatch",
            ReasonCode::TicketNotFound => "ticket_not_found",
            ReasonCode::PolicyViolation => "policy_violation",
            ReasonCode::ManifestOrLogInvalid => "manifest_or_log_invalid",
            ReasonCode::SigningUnavailable => "signing_unavailable",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infrastructure failures, kept strictly apart from business denials.
///
/// A scan that cannot be decided because of one of these is recorded as an
/// `Error` scan attempt and surfaced to the gate as RETRY with a correlation
/// id, never as a silent ALLOW and never as a DENY.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InfraError {
    /// The backing store (nonce ledger, ticket store, scan log) failed.
    #[error("backing store unavailable: {0}")]
    Storage(String),

    /// The per-request validation deadline elapsed before a decision.
    #[error("validation deadline exceeded")]
    DeadlineExceeded,

    /// A collaborator (policy engine, device registry) failed to answer.
    #[error("collaborator unavailable: {0}")]
    Collaborator(String),
}
