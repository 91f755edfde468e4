//! Conformance test suite for [`ScanStorage`] implementations.
//!
//! Backend-agnostic checks that any backend must pass before it is trusted
//! under a gate. The suite covers:
//!
//! - **atomic**: single-use semantics and TTL expiry of `check_and_mark`
//! - **claim**: the conditional Valid -> Used transition and reinstatement
//! - **journal**: scan-log append order, admission counting, manifest
//!   version monotonicity, merged-id bookkeeping
//! - **concurrent**: real `tokio::spawn` races against the atomic primitives
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory producing a
//! fresh, empty storage instance per test:
//!
//! ```ignore
//! let report = run_conformance_suite(|| async { MyStorage::connect().await }).await;
//! assert_eq!(report.failed, 0, "{report}");
//! ```

mod atomic;
mod claim;
mod concurrent;
mod journal;

use std::fmt;
use std::future::Future;

use crate::traits::ScanStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub category: String,
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => TestResult {
                category: category.to_string(),
                name: name.to_string(),
                passed: true,
                message: None,
            },
            Err(msg) => TestResult {
                category: category.to_string(),
                name: name.to_string(),
                passed: false,
                message: Some(msg),
            },
        }
    }
}

/// Aggregate outcome of a full suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "conformance: {} passed, {} failed", self.passed, self.failed)?;
        for result in &self.results {
            if !result.passed {
                writeln!(
                    f,
                    "  FAIL {}/{}: {}",
                    result.category,
                    result.name,
                    result.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run every conformance test against fresh storage instances.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();
    results.extend(atomic::run(&factory).await);
    results.extend(claim::run(&factory).await);
    results.extend(journal::run(&factory).await);
    results.extend(concurrent::run(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;
    ConformanceReport {
        results,
        passed,
        failed,
    }
}
