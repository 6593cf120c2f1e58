//! Upload pipeline on top of the transfer engine.
//!
//! [`MediaUploader`] produces per-upload [`UploadHandle`]s that run the full
//! pipeline: optional media inspection and standardization, an optional
//! confirmation gate, then chunked transport through the shared
//! [`medialift_registry::UploadRegistry`]. Collaborators (the standardizer
//! and the telemetry sink) are trait seams injected at construction.

mod standardize;
mod telemetry;
mod uploader;

pub use standardize::{Inspection, MediaStandardizer, PassthroughStandardizer, StandardizeError};
pub use telemetry::{NoopSink, TelemetryEvent, TelemetrySink};
pub use uploader::{MediaUploader, ProgressCallback, ResultCallback, UploadHandle};
