//! Media inspection and standardization seam.
//!
//! Before transport, an upload may be inspected and, when non-standard,
//! transcoded into a substitute file. Both steps live behind
//! [`MediaStandardizer`] so the pipeline stays decoupled from any concrete
//! media toolchain.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Outcome of inspecting a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    /// The file can be transported as-is.
    Standard,
    /// The file needs standardization before transport.
    NonStandard {
        /// Human-readable reasons, surfaced in telemetry.
        reasons: Vec<String>,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StandardizeError {
    #[error("inspection failed: {0}")]
    Inspect(String),
    #[error("standardization failed: {0}")]
    Convert(String),
}

/// Inspects a source file and produces a standardized substitute when the
/// original is not transportable as-is.
///
/// `standardize` returns the path of the substitute file; the original is
/// left untouched.
pub trait MediaStandardizer: Send + Sync {
    fn inspect<'a>(
        &'a self,
        source: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Inspection, StandardizeError>> + Send + 'a>>;

    fn standardize<'a>(
        &'a self,
        source: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf, StandardizeError>> + Send + 'a>>;

    /// Whether a standardization failure aborts the upload. When `false`
    /// the pipeline transports the original file instead.
    fn cancel_on_failure(&self) -> bool {
        true
    }
}

/// Standardizer that accepts every file as-is.
pub struct PassthroughStandardizer;

impl MediaStandardizer for PassthroughStandardizer {
    fn inspect<'a>(
        &'a self,
        _source: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Inspection, StandardizeError>> + Send + 'a>> {
        Box::pin(async { Ok(Inspection::Standard) })
    }

    fn standardize<'a>(
        &'a self,
        _source: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf, StandardizeError>> + Send + 'a>> {
        Box::pin(async {
            Err(StandardizeError::Convert(
                "passthrough standardizer cannot convert".into(),
            ))
        })
    }
}
