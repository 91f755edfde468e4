//! Turnstile core -- credential data model, per-tenant Ed25519 signing, and
//! the admission decision pipeline.
//!
//! The decision pipeline is a single pure function ([`decision::validate`])
//! parameterized by a [`decision::DecisionLookup`] implementation. The online
//! service and the offline device validator both run the same pipeline with
//! different lookups, so the two paths cannot diverge on check order.

pub mod credential;
pub mod decision;
pub mod error;
pub mod ids;
pub mod keys;
pub mod policy;
pub mod registry;
pub mod types;

pub use credential::{issue, verify_signature};
pub use decision::{validate, DecisionLookup, TicketView, ValidatorConfig};
pub use error::{InfraError, ReasonCode};
pub use keys::{KeyProvider, Keyring, SigningError};
pub use policy::{PolicyEngine, PolicySet, StaticPolicyEngine};
pub use registry::{DeviceBinding, DeviceRegistry, StaticDeviceRegistry};
pub use types::{
    Credential, Decision, GateSignal, OfflineManifest, ReconciliationRecord, ResolutionAction,
    ScanAttempt, ScanConflict, ScanMode, ScanOutcome, ScanRequest, ScanResolution, ScanResult,
    Ticket, TicketStatus, TicketSummary,
};
