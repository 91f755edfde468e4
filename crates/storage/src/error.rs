/// All errors a [`crate::ScanStorage`] implementation can return.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No ticket with the given id.
    #[error("ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: String },

    /// A ticket with this id already exists.
    #[error("ticket already exists: {ticket_id}")]
    TicketAlreadyExists { ticket_id: String },

    /// A manifest was stored with a version not greater than the latest.
    #[error("manifest version conflict for event {event_id}: {version} <= latest {latest}")]
    ManifestVersionConflict {
        event_id: String,
        version: u64,
        latest: u64,
    },

    /// A reconciliation record with this batch id already exists with
    /// different content. Identical re-puts are accepted (idempotence).
    #[error("reconciliation record conflict for batch {batch_id}")]
    ReconciliationConflict { batch_id: String },

    /// A backend-specific error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
