//! Storage seam for the online validation path.
//!
//! All cross-request coordination -- nonce marks, duplicate-guard marks, the
//! conditional ticket-status transition -- goes through a [`ScanStorage`]
//! implementation's atomic primitives. Validation requests themselves share no
//! in-process mutable state.

pub mod conformance;
mod error;
mod memory;
mod online;
mod traits;

pub use error::StorageError;
pub use memory::{MemoryStorage, StorageSnapshot};
pub use online::{OnlineLookup, OnlineValidator};
pub use traits::ScanStorage;
