//! Reconciliation: merging offline scan logs back into authoritative state.
//!
//! After connectivity resumes, devices upload their signed scan logs. The
//! engine merges them with the online scan history for the event, resolves
//! competing claims on the same ticket deterministically, finalizes ticket
//! state, and emits a discrepancy report for operational review.
//!
//! Runs are idempotent by batch identity: the run id is derived from the
//! uploaded batch ids, a rerun on the same input returns the stored
//! [`turnstile_core::ReconciliationRecord`] byte for byte, and already-merged
//! scan ids are never re-processed or double-flagged.
//!
//! Per-event serialization is the caller's contract: a given event must have
//! at most one reconciliation in flight, while different events may
//! reconcile fully in parallel.

mod engine;
mod report;

pub use engine::{reconcile, ReconcileError};
pub use report::render_report;
