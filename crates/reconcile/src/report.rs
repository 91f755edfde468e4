//! Human-readable discrepancy report for operational review.

use std::fmt::Write as _;

use turnstile_core::{ReconciliationRecord, ResolutionAction};

/// Render a reconciliation record as a discrepancy report: every conflict
/// with the device and staff involved and the time delta between the winning
/// and losing attempts, plus any offline false-denies.
pub fn render_report(record: &ReconciliationRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "reconciliation {} for event {}",
        record.batch_id, record.event_id
    );
    let _ = writeln!(
        out,
        "  {} scans merged, {} conflicts, {} resolutions",
        record.scans_merged,
        record.conflicts.len(),
        record.resolutions.len()
    );

    for resolution in &record.resolutions {
        let label = match resolution.action {
            ResolutionAction::ConfirmedOnline => "confirmed online admission",
            ResolutionAction::AppliedOffline => "applied offline admission",
            ResolutionAction::FalseDeny => "FALSE DENY (valid ticket denied offline)",
        };
        let _ = writeln!(
            out,
            "  ticket {}: {} via scan {}",
            resolution.ticket_id, label, resolution.scan_id
        );
    }

    for conflict in &record.conflicts {
        let _ = writeln!(
            out,
            "  CONFLICT ticket {}: scan {} (device {}, staff {}) lost to {} by {}ms [{}]",
            conflict.ticket_id,
            conflict.losing_scan_id,
            conflict.losing_device_id,
            conflict.losing_staff_user_id,
            conflict.winning_scan_id,
            conflict.delta_ms,
            conflict.reason_code
        );
    }
    out
}
