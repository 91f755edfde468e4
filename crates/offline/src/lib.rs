//! Offline admission: signed manifests, the device-local validator, and the
//! uploadable scan log.
//!
//! The offline validator runs the same decision pipeline as the online path
//! (see `turnstile_core::decision`), swapping the authoritative lookups for a
//! cached manifest plus device-local state. The membership check is
//! conservative-deny: a ticket id absent from the manifest is denied as
//! `TicketNotFound` even if it would have been valid online, trading a small
//! false-deny rate at the staleness boundary for never admitting an
//! already-used ticket.

mod error;
mod log;
mod manifest;
mod validator;

pub use error::OfflineError;
pub use log::{export_batch, verify_batch, ScanLogFile, SignedLogBatch};
pub use manifest::{build_manifest, manifest_digest, verify_manifest};
pub use validator::{DeviceTrustStore, OfflineValidator};
