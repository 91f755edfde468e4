//! `check_and_mark` semantics: single use, key independence, TTL expiry.

use std::future::Future;

use time::Duration;

use super::TestResult;
use crate::traits::ScanStorage;

pub(super) async fn run<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "atomic",
            "first_mark_wins_second_loses",
            first_mark_wins_second_loses(factory).await,
        ),
        TestResult::from_result(
            "atomic",
            "distinct_keys_do_not_interfere",
            distinct_keys_do_not_interfere(factory).await,
        ),
        TestResult::from_result(
            "atomic",
            "expired_mark_frees_the_key",
            expired_mark_frees_the_key(factory).await,
        ),
    ]
}

async fn first_mark_wins_second_loses<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let ttl = Duration::seconds(60);
    let first = storage
        .check_and_mark("nonce:n-1", ttl)
        .await
        .map_err(|e| format!("first mark: {e}"))?;
    if !first {
        return Err("first mark on a fresh key returned false".to_string());
    }
    let second = storage
        .check_and_mark("nonce:n-1", ttl)
        .await
        .map_err(|e| format!("second mark: {e}"))?;
    if second {
        return Err("second mark on the same key returned true".to_string());
    }
    Ok(())
}

async fn distinct_keys_do_not_interfere<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let ttl = Duration::seconds(60);
    for key in ["nonce:a", "nonce:b", "reentry:a"] {
        let fresh = storage
            .check_and_mark(key, ttl)
            .await
            .map_err(|e| format!("mark {key}: {e}"))?;
        if !fresh {
            return Err(format!("fresh key {key} reported as already marked"));
        }
    }
    Ok(())
}

async fn expired_mark_frees_the_key<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ScanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    // Mark with an already-elapsed TTL; the key must be free on re-check.
    storage
        .check_and_mark("nonce:expiring", Duration::seconds(-1))
        .await
        .map_err(|e| format!("mark: {e}"))?;
    let reusable = storage
        .check_and_mark("nonce:expiring", Duration::seconds(60))
        .await
        .map_err(|e| format!("re-mark: {e}"))?;
    if !reusable {
        return Err("expired mark still blocks the key".to_string());
    }
    Ok(())
}
