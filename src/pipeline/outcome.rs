//! What a filter or handler tells the pipeline to do next.

use crate::dispatch::Dispatch;

use super::pending::Pending;

/// Result of a request filter.
#[must_use]
pub enum FilterOutcome {
    /// Move on to the next request filter.
    Continue,
    /// Skip the remaining request filters and the router.
    RequestHandled,
    /// Suspend until the pending result resolves, then act on its value.
    AsyncStarted(Pending<FilterDone>),
    /// Hand the exchange to another execution context; the pipeline resumes
    /// at the next filter when the hop calls back.
    Dispatched(Dispatch),
}

/// The two outcomes a suspended request filter can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDone {
    Continue,
    RequestHandled,
}

impl From<FilterDone> for FilterOutcome {
    fn from(done: FilterDone) -> Self {
        match done {
            FilterDone::Continue => FilterOutcome::Continue,
            FilterDone::RequestHandled => FilterOutcome::RequestHandled,
        }
    }
}

/// Result of a route handler.
///
/// Only write to the response directly when returning `Handled`. Async
/// handlers should leave their result in an attachment for a response filter
/// to write.
#[must_use]
pub enum RouteOutcome {
    Handled,
    /// Handed off; the pipeline stops in the routing phase and re-invokes the
    /// same route when the hop calls back.
    Dispatched(Dispatch),
    /// Suspend until the pending result resolves, then run response filters.
    Async(Pending<()>),
}

impl std::fmt::Debug for FilterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => f.write_str("Continue"),
            Self::RequestHandled => f.write_str("RequestHandled"),
            Self::AsyncStarted(_) => f.write_str("AsyncStarted(..)"),
            Self::Dispatched(_) => f.write_str("Dispatched(..)"),
        }
    }
}

impl std::fmt::Debug for RouteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handled => f.write_str("Handled"),
            Self::Dispatched(_) => f.write_str("Dispatched(..)"),
            Self::Async(_) => f.write_str("Async(..)"),
        }
    }
}
