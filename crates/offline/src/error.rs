use turnstile_core::SigningError;

/// Errors raised by manifest handling and the device scan log.
#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    /// Manifest signature or structure failed verification.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Uploaded log batch signature or structure failed verification.
    #[error("log batch invalid: {0}")]
    LogInvalid(String),

    /// The tenant or device key needed for signing was unavailable.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// Storage failure while snapshotting valid tickets.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Local log file I/O failure.
    #[error("scan log I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Local log file contained a line that is not a scan attempt.
    #[error("scan log corrupt at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}
