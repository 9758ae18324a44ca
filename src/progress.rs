//! Progress-callback trait for per-stage pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::PipelineBuilder::progress_callback`] to receive events as a run
//! moves through its stages. Callers can forward them to a spinner, a log or
//! a channel without the library knowing how the host application reports
//! progress.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docqr::{PipelineProgressCallback, StageName};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_stage_finish(&self, stage: StageName, ok: bool, _message: Option<&str>) {
//!         self.finished.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage}: {}", if ok { "ok" } else { "failed" });
//!     }
//! }
//! ```

use crate::output::{RunRecord, StageName};
use std::sync::Arc;
use std::time::Duration;

/// Called by the orchestrator as a run progresses.
///
/// Implementations must be `Send + Sync`: several runs may share one callback
/// when the CLI processes inputs concurrently. All methods have no-op
/// defaults so callers only override what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once, before the Extract stage.
    fn on_run_start(&self, input_filename: &str) {
        let _ = input_filename;
    }

    /// Called before a stage's first attempt. Skipped stages never start.
    fn on_stage_start(&self, stage: StageName) {
        let _ = stage;
    }

    /// Called before a stage is retried.
    ///
    /// # Arguments
    /// * `attempt`: the attempt about to run (2 for the first retry)
    /// * `delay`  : backoff slept before that attempt
    /// * `error`  : message of the failure that triggered the retry
    fn on_stage_retry(&self, stage: StageName, attempt: u32, delay: Duration, error: &str) {
        let _ = (stage, attempt, delay, error);
    }

    /// Called when a started stage ends, successfully or not.
    fn on_stage_finish(&self, stage: StageName, ok: bool, message: Option<&str>) {
        let _ = (stage, ok, message);
    }

    /// Called once with the finished record, after it has been appended to
    /// history.
    fn on_run_complete(&self, record: &RunRecord) {
        let _ = record;
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type held by [`crate::Pipeline`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
