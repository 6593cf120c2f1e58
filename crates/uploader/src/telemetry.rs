//! Fire-and-forget telemetry seam for pipeline outcomes.

use medialift_protocol::UploadError;

/// Pipeline events worth reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    UploadSucceeded {
        id: String,
        bytes: u64,
    },
    UploadFailed {
        id: String,
        error: UploadError,
    },
    UploadCancelled {
        id: String,
    },
    StandardizationApplied {
        id: String,
        reasons: Vec<String>,
    },
    StandardizationFailed {
        id: String,
        error: String,
    },
}

/// Receives pipeline events. Implementations must not block; failures are
/// theirs to swallow.
pub trait TelemetrySink: Send + Sync {
    fn report(&self, event: TelemetryEvent);
}

/// Sink that drops every event.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn report(&self, _event: TelemetryEvent) {}
}
