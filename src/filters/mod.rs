//! Built-in filters.
//!
//! - [`access_log`]: logs one line per exchange once the response is final.
//! - [`marshal`]: turns a response object left by a handler into a JSON body.

pub mod marshal;

pub use marshal::{Problem, ResponseObject, marshaling, respond_with, respond_with_problem};

use crate::context::Exchange;
use crate::error::BoxError;

/// Response filter that logs each request's method, path, matched template,
/// status, and duration.
///
/// Emits a single `tracing::info!` line in the format:
///
/// ```text
/// METHOD /path [template] - STATUS (duration)
/// ```
///
/// Register it last so the status reflects every earlier response filter.
pub fn access_log() -> impl Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static {
    |exchange: &mut Exchange| {
        let request = exchange.request();
        let template = exchange.matched_template().unwrap_or("-");
        let status = exchange.response().status().as_u16();
        let duration = exchange.started_at().elapsed();

        tracing::info!(
            method = %request.method(),
            path = %request.path(),
            template,
            status,
            ?duration,
            "{} {} [{}] - {} ({:?})",
            request.method(),
            request.path(),
            template,
            status,
            duration
        );
        Ok(())
    }
}
