//! Random identifier helpers. All ids are lowercase hex from `OsRng`.

use rand::RngCore;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A fresh scan-attempt id.
pub fn new_scan_id() -> String {
    format!("scan-{}", random_hex(8))
}

/// A fresh single-use credential nonce (128 bits).
pub fn new_nonce() -> String {
    random_hex(16)
}

/// A correlation id attached to infrastructure-error outcomes so a gate
/// operator can tie a RETRY back to server-side logs.
pub fn new_correlation_id() -> String {
    format!("corr-{}", random_hex(6))
}
