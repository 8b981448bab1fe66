// =============================================================================
// Diagnostics — injected observability sink for degraded failures
// =============================================================================
//
// The feed never raises: transport failures, malformed frames, invalid
// symbols and listener faults are reported here and then swallowed.
// `RecordingDiagnostics` logs every report through `tracing` and keeps a
// bounded in-memory log for the dashboard API and for tests.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{ErrorKind, FeedError};

/// Maximum number of recent reports retained by [`RecordingDiagnostics`].
const MAX_RECENT_REPORTS: usize = 50;

pub trait Diagnostics: Send + Sync {
    /// Record a non-fatal failure.  `context` names the operation and key.
    fn report(&self, context: &str, error: &FeedError);
}

fn log_report(context: &str, error: &FeedError) {
    match error.kind() {
        ErrorKind::Transport => {
            error!(context, kind = %error.kind(), error = %error, "feed failure")
        }
        _ => warn!(context, kind = %error.kind(), error = %error, "feed failure"),
    }
}

/// A recorded failure for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRecord {
    pub kind: ErrorKind,
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Logs each report as a structured `tracing` event and keeps the most
/// recent ones.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    records: RwLock<VecDeque<DiagnosticRecord>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recent reports, oldest first.
    pub fn recent(&self) -> Vec<DiagnosticRecord> {
        self.records.read().iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.records.read().iter().filter(|r| r.kind == kind).count()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn report(&self, context: &str, error: &FeedError) {
        log_report(context, error);
        let mut records = self.records.write();
        records.push_back(DiagnosticRecord {
            kind: error.kind(),
            context: context.to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
        while records.len() > MAX_RECENT_REPORTS {
            records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_keeps_bounded_history() {
        let diag = RecordingDiagnostics::new();
        for i in 0..(MAX_RECENT_REPORTS + 5) {
            diag.report("test", &FeedError::Malformed(format!("frame {i}")));
        }
        let recent = diag.recent();
        assert_eq!(recent.len(), MAX_RECENT_REPORTS);
        assert_eq!(recent[0].message, "malformed payload: frame 5");
        assert_eq!(diag.count_of(ErrorKind::Malformed), MAX_RECENT_REPORTS);
        assert_eq!(diag.count_of(ErrorKind::Transport), 0);
    }
}
