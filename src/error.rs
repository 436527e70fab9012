//! Errors surfaced to the pipeline's exception handler.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Phase;

/// Error type returned by user filters, handlers, and pending results.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the pipeline hands to its exception handler.
///
/// Failures in the request-filter and routing phases force the exchange into
/// the response-filter phase; response-filter failures are reported one by
/// one while the remaining response filters keep running.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request filter #{index} failed: {source}")]
    RequestFilter {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("route handler failed: {source}")]
    Route {
        #[source]
        source: BoxError,
    },

    #[error("pending result failed during {phase}: {source}")]
    Pending {
        phase: Phase,
        #[source]
        source: BoxError,
    },

    #[error("pending result did not resolve within {after:?} during {phase}")]
    TimedOut { phase: Phase, after: Duration },

    #[error("dispatched work failed: {source}")]
    Dispatch {
        #[source]
        source: BoxError,
    },

    #[error("response filter #{index} failed: {source}")]
    ResponseFilter {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("panic during {phase}: {message}")]
    Panicked { phase: Phase, message: String },

    #[error("no tokio runtime available to await a pending result")]
    NoRuntime,
}

impl PipelineError {
    /// `true` for failures raised by response filters, which never move the
    /// exchange to another phase.
    pub fn is_response_filter_failure(&self) -> bool {
        matches!(
            self,
            Self::ResponseFilter { .. }
                | Self::Panicked {
                    phase: Phase::ResponseFilters,
                    ..
                }
        )
    }
}

/// Extracts a readable message from a `catch_unwind` payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
