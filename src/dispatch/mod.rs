//! Moving an exchange to another execution context and back.
//!
//! A [`Dispatch`] is a one-shot hop: the pipeline hands it the exchange and a
//! [`Resume`] token, and the offload is expected to eventually give the
//! exchange back through that token, from any thread. A [`DispatchBridge`]
//! packages a reusable offload as filters and route wrappers that hop exactly
//! once per exchange.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tracing::debug;

use crate::context::Exchange;
use crate::error::{BoxError, PipelineError, panic_message};
use crate::pipeline::{FilterOutcome, Pipeline, RouteOutcome};

// Identifies one dispatch point across every bridge in the process.
static NEXT_POINT: AtomicU64 = AtomicU64::new(1);

fn next_point() -> u64 {
    NEXT_POINT.fetch_add(1, Ordering::Relaxed)
}

/// A pending hop to another execution context.
#[must_use = "a dispatch does nothing unless returned to the pipeline"]
pub struct Dispatch {
    offload: Box<dyn FnOnce(Exchange, Resume) + Send + 'static>,
}

impl Dispatch {
    /// `offload` receives the exchange and must eventually call
    /// [`Resume::resume`] or [`Resume::fail`] with it. Dropping both ends the
    /// request without a pipeline response.
    pub fn new<F>(offload: F) -> Self
    where
        F: FnOnce(Exchange, Resume) + Send + 'static,
    {
        Self {
            offload: Box::new(offload),
        }
    }

    pub(crate) fn run(self, exchange: Exchange, resume: Resume) {
        (self.offload)(exchange, resume)
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dispatch(..)")
    }
}

/// Hands a dispatched exchange back to its pipeline.
#[must_use = "the exchange stays parked until resumed"]
#[derive(Debug)]
pub struct Resume {
    pipeline: Pipeline,
}

impl Resume {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Continues the pipeline where it stopped, on the calling thread.
    pub fn resume(self, exchange: Exchange) {
        self.pipeline.handle(exchange);
    }

    /// Continues the pipeline with `error` reported to the exception handler;
    /// the exchange then goes straight to the response filters.
    pub fn fail(self, mut exchange: Exchange, error: impl Into<BoxError>) {
        exchange.state.deferred_error = Some(PipelineError::Dispatch {
            source: error.into(),
        });
        self.pipeline.handle(exchange);
    }
}

/// A reusable offload, exposed as request filters and route wrappers.
///
/// Every filter or wrapper produced by a bridge is its own dispatch point and
/// hops at most once per exchange. A route wrapper dispatches first and runs
/// the wrapped handler when the pipeline re-invokes the route after the hop.
///
/// ```
/// use switchyard::dispatch::DispatchBridge;
/// use switchyard::pipeline::{Pipeline, RouteOutcome};
/// use switchyard::router::Router;
///
/// let blocking = DispatchBridge::blocking(|_exchange| {
///     // synchronous database call
///     Ok(())
/// });
/// let router = Router::builder()
///     .get("/report", blocking.route_handler(|_exchange| Ok(RouteOutcome::Handled)))
///     .build()
///     .unwrap();
/// let pipeline = Pipeline::builder(router)
///     .request_filter(blocking.request_filter())
///     .build();
/// # drop(pipeline);
/// ```
#[derive(Clone)]
pub struct DispatchBridge {
    offload: Arc<dyn Fn(Exchange, Resume) + Send + Sync + 'static>,
}

impl DispatchBridge {
    pub fn new<F>(offload: F) -> Self
    where
        F: Fn(Exchange, Resume) + Send + Sync + 'static,
    {
        Self {
            offload: Arc::new(offload),
        }
    }

    /// Runs `work` on the runtime's blocking pool, then resumes. An error or
    /// panic from `work` resumes through [`Resume::fail`]. Without a runtime
    /// the work runs inline.
    pub fn blocking<W>(work: W) -> Self
    where
        W: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        Self::new(move |exchange, resume| {
            let work = Arc::clone(&work);
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || run_blocking(work.as_ref(), exchange, resume));
                }
                Err(_) => run_blocking(work.as_ref(), exchange, resume),
            }
        })
    }

    /// A request filter that hops once, then lets the pipeline continue with
    /// the next filter.
    pub fn request_filter(
        &self,
    ) -> impl Fn(&mut Exchange) -> Result<FilterOutcome, BoxError> + Send + Sync + 'static {
        let point = next_point();
        let bridge = self.clone();
        move |exchange: &mut Exchange| {
            if exchange.state.fired.insert(point) {
                debug!(point, "dispatching from request filter");
                Ok(FilterOutcome::Dispatched(bridge.dispatch()))
            } else {
                Ok(FilterOutcome::Continue)
            }
        }
    }

    /// Wraps a route handler so that it runs after a hop.
    pub fn route_handler<H>(
        &self,
        next: H,
    ) -> impl Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        let point = next_point();
        let bridge = self.clone();
        move |exchange: &mut Exchange| {
            if exchange.state.fired.insert(point) {
                debug!(point, "dispatching before route handler");
                Ok(RouteOutcome::Dispatched(bridge.dispatch()))
            } else {
                next(exchange)
            }
        }
    }

    fn dispatch(&self) -> Dispatch {
        let offload = Arc::clone(&self.offload);
        Dispatch::new(move |exchange, resume| offload(exchange, resume))
    }
}

impl std::fmt::Debug for DispatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DispatchBridge(..)")
    }
}

fn run_blocking<W>(work: &W, mut exchange: Exchange, resume: Resume)
where
    W: Fn(&mut Exchange) -> Result<(), BoxError> + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| work(&mut exchange))) {
        Ok(Ok(())) => resume.resume(exchange),
        Ok(Err(error)) => resume.fail(exchange, error),
        Err(payload) => resume.fail(exchange, panic_message(payload.as_ref())),
    }
}
