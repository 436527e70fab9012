//! The request pipeline: request filters, routing, response filters.
//!
//! A [`Pipeline`] drives one [`Exchange`] through three phases:
//!
//! ```text
//! RequestFilters ──(exhausted)──▶ Router ──(Handled / Async resolved)──▶ ResponseFilters
//!        │                          │                                        ▲
//!        └──(RequestHandled / error)┴──────────────(error)───────────────────┘
//! ```
//!
//! Any step may suspend: a request filter returning
//! [`FilterOutcome::AsyncStarted`], a route returning [`RouteOutcome::Async`],
//! or either of them dispatching to another execution context. The phase and
//! filter cursor live on the exchange, so [`Pipeline::handle`] is the single
//! entry point both for a fresh request and for every resumption, on
//! whichever thread the resumption happens.
//!
//! Response filters always run, in registration order, exactly once per
//! request: after normal completion, after a short circuit, and after a
//! failure. A failing response filter is reported to the exception handler
//! and the remaining ones still run.

mod outcome;
mod pending;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::context::{Exchange, take_salvaged};
use crate::dispatch::{Dispatch, Resume};
use crate::error::{BoxError, PipelineError, panic_message};
use crate::http::{Request, Response, StatusCode};
use crate::router::Router;

pub use outcome::{FilterDone, FilterOutcome, RouteOutcome};
pub use pending::Pending;

use pending::Finish;

/// Predicate deciding whether a filter or route applies to an exchange.
pub type Guard = Arc<dyn Fn(&Exchange) -> bool + Send + Sync + 'static>;

pub type RequestFilter =
    Arc<dyn Fn(&mut Exchange) -> Result<FilterOutcome, BoxError> + Send + Sync + 'static>;

/// Response filters must not block and cannot suspend. Anything asynchronous
/// they depend on has to be finished and attached before this phase.
pub type ResponseFilter =
    Arc<dyn Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static>;

/// Receives every failure. Expected to write a failure response unless the
/// response has already started.
pub type ExceptionHandler = Arc<dyn Fn(&PipelineError, &mut Exchange) + Send + Sync + 'static>;

/// Where an exchange is in the pipeline. Ordered; an exchange only moves
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Phase {
    #[default]
    RequestFilters,
    Router,
    ResponseFilters,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestFilters => "request filters",
            Self::Router => "router",
            Self::ResponseFilters => "response filters",
        })
    }
}

/// Logs the failure and sends `500 Internal Server Error` if nothing has
/// been sent yet.
pub fn default_exception_handler(error: &PipelineError, exchange: &mut Exchange) {
    let method = exchange.request().method();
    let path = exchange.request().path();
    if error.is_response_filter_failure() {
        warn!(method = %method, path = %path, error = %error, "response filter failed");
    } else {
        error!(method = %method, path = %path, error = %error, "request failed");
    }
    if !exchange.response().is_started() {
        let status = StatusCode::InternalServerError;
        exchange.send(status, status.canonical_reason());
    }
}

struct Guarded<F> {
    guard: Option<Guard>,
    filter: F,
}

impl<F> Guarded<F> {
    fn admits(&self, exchange: &Exchange) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard(exchange))
    }
}

struct Inner {
    request_filters: Vec<Guarded<RequestFilter>>,
    response_filters: Vec<Guarded<ResponseFilter>>,
    router: Router,
    exception_handler: ExceptionHandler,
    runtime: Option<Handle>,
    pending_timeout: Option<Duration>,
}

/// The pipeline state machine. Cheap to clone; clones share configuration.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

enum Suspension {
    Filter(Pending<FilterDone>),
    Route(Pending<()>),
    Dispatch(Dispatch),
}

// Exchanges re-entering on a thread that is already driving the pipeline wait
// here instead of recursing; the outermost `handle` drains them.
#[derive(Default)]
struct Trampoline {
    draining: bool,
    queue: VecDeque<(Pipeline, Exchange)>,
}

thread_local! {
    static TRAMPOLINE: RefCell<Trampoline> = RefCell::new(Trampoline::default());
}

struct DrainGuard;

impl Drop for DrainGuard {
    // After an unwind nobody is left to drive queued exchanges; dropping them
    // closes their completion channels.
    fn drop(&mut self) {
        let stranded = TRAMPOLINE.with(|cell| {
            let mut trampoline = cell.borrow_mut();
            trampoline.draining = false;
            std::mem::take(&mut trampoline.queue)
        });
        if !stranded.is_empty() {
            error!(count = stranded.len(), "pipeline unwound; dropping queued exchanges");
        }
    }
}

impl Pipeline {
    pub fn builder(router: Router) -> PipelineBuilder {
        PipelineBuilder::new(router)
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Runs `request` through the pipeline and waits for the final response.
    ///
    /// If the exchange is dropped without completing (a dispatch offload
    /// that never resumed), a `500` is returned instead.
    pub async fn serve(&self, request: Request) -> Response {
        let keep_alive = request.is_keep_alive();
        let mut exchange = Exchange::new(request);
        let completion = exchange.completion();
        self.handle(exchange);

        let mut response = match completion.await {
            Ok(response) => response,
            Err(_) => {
                error!("exchange dropped before a response was produced");
                let status = StatusCode::InternalServerError;
                Response::new(status).body(status.canonical_reason())
            }
        };
        if !keep_alive {
            response.set_keep_alive(false);
        }
        response
    }

    /// Advances `exchange` from wherever it last stopped.
    ///
    /// Returns as soon as the exchange completes or suspends; it never blocks
    /// on a pending result. Called once per new request and once per
    /// resumption.
    pub fn handle(&self, mut exchange: Exchange) {
        exchange.state.parked_on = None;
        let drive = TRAMPOLINE.with(|cell| {
            let mut trampoline = cell.borrow_mut();
            trampoline.queue.push_back((self.clone(), exchange));
            !std::mem::replace(&mut trampoline.draining, true)
        });
        if !drive {
            return;
        }

        let _guard = DrainGuard;
        while let Some((pipeline, exchange)) =
            TRAMPOLINE.with(|cell| cell.borrow_mut().queue.pop_front())
        {
            pipeline.advance(exchange);
        }
    }

    fn advance(&self, mut exchange: Exchange) {
        if let Some(error) = exchange.state.deferred_error.take() {
            self.fail(error, &mut exchange);
        }

        if exchange.phase() == Phase::RequestFilters {
            match self.run_request_filters(&mut exchange) {
                Ok(None) => {}
                Ok(Some(suspension)) => return self.suspend(exchange, suspension),
                Err(error) => self.fail(error, &mut exchange),
            }
        }

        if exchange.phase() == Phase::Router {
            match self.run_router(&mut exchange) {
                Ok(None) => {}
                Ok(Some(suspension)) => return self.suspend(exchange, suspension),
                Err(error) => self.fail(error, &mut exchange),
            }
        }

        self.run_response_filters(&mut exchange);
        debug!(
            method = %exchange.request().method(),
            path = %exchange.request().path(),
            status = exchange.response().status().as_u16(),
            "exchange complete"
        );
        exchange.complete();
    }

    fn run_request_filters(
        &self,
        exchange: &mut Exchange,
    ) -> Result<Option<Suspension>, PipelineError> {
        let phase = Phase::RequestFilters;
        let filters = &self.inner.request_filters;

        while let Some(entry) = filters.get(exchange.state.cursor) {
            let index = exchange.state.cursor;
            let failed = |source| PipelineError::RequestFilter { index, source };

            if !invoke(phase, || Ok(entry.admits(exchange)), failed)? {
                exchange.state.cursor += 1;
                continue;
            }

            match invoke(phase, || (entry.filter)(exchange), failed)? {
                FilterOutcome::Continue => exchange.state.cursor += 1,
                FilterOutcome::RequestHandled => {
                    debug!(filter = index, "request handled by filter");
                    exchange.state.enter(Phase::ResponseFilters);
                    return Ok(None);
                }
                FilterOutcome::AsyncStarted(pending) => {
                    return Ok(Some(Suspension::Filter(pending)));
                }
                FilterOutcome::Dispatched(dispatch) => {
                    exchange.state.cursor = index + 1;
                    return Ok(Some(Suspension::Dispatch(dispatch)));
                }
            }
        }

        exchange.state.enter(Phase::Router);
        Ok(None)
    }

    fn run_router(&self, exchange: &mut Exchange) -> Result<Option<Suspension>, PipelineError> {
        let outcome = invoke(
            Phase::Router,
            || self.inner.router.apply(exchange),
            |source| PipelineError::Route { source },
        )?;

        Ok(match outcome {
            RouteOutcome::Handled => {
                exchange.state.enter(Phase::ResponseFilters);
                None
            }
            RouteOutcome::Dispatched(dispatch) => Some(Suspension::Dispatch(dispatch)),
            RouteOutcome::Async(pending) => Some(Suspension::Route(pending)),
        })
    }

    fn run_response_filters(&self, exchange: &mut Exchange) {
        exchange.state.enter(Phase::ResponseFilters);

        for (index, entry) in self.inner.response_filters.iter().enumerate() {
            let result = invoke(
                Phase::ResponseFilters,
                || {
                    if entry.admits(exchange) {
                        (entry.filter)(exchange)
                    } else {
                        Ok(())
                    }
                },
                |source| PipelineError::ResponseFilter { index, source },
            );
            if let Err(error) = result {
                warn!(filter = index, error = %error, "response filter failed");
                self.report(&error, exchange);
            }
        }
    }

    // Phase 1/2 failure: report once, then go straight to response filters.
    fn fail(&self, error: PipelineError, exchange: &mut Exchange) {
        warn!(
            phase = %exchange.phase(),
            method = %exchange.request().method(),
            path = %exchange.request().path(),
            error = %error,
            "pipeline step failed"
        );
        self.report(&error, exchange);
        exchange.state.enter(Phase::ResponseFilters);
    }

    fn report(&self, error: &PipelineError, exchange: &mut Exchange) {
        let handler = &self.inner.exception_handler;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(error, exchange))) {
            error!(
                panic = %panic_message(payload.as_ref()),
                "exception handler panicked"
            );
        }
    }

    fn suspend(&self, exchange: Exchange, suspension: Suspension) {
        match suspension {
            Suspension::Dispatch(dispatch) => {
                let phase = exchange.phase();
                debug!(phase = %phase, "exchange dispatched");
                let mut exchange = exchange;
                exchange.state.parked_on = Some(thread::current().id());
                let resume = Resume::new(self.clone());
                let offload = AssertUnwindSafe(|| dispatch.run(exchange, resume));
                if let Err(payload) = panic::catch_unwind(offload) {
                    let message = panic_message(payload.as_ref());
                    match take_salvaged() {
                        Some(mut exchange) => {
                            exchange.state.deferred_error =
                                Some(PipelineError::Panicked { phase, message });
                            self.handle(exchange);
                        }
                        None => error!(
                            panic = %message,
                            "dispatch offload panicked after releasing the exchange"
                        ),
                    }
                }
            }
            Suspension::Filter(pending) => {
                self.await_pending(exchange, pending, |exchange, result| match result {
                    Ok(FilterDone::Continue) => exchange.state.cursor += 1,
                    Ok(FilterDone::RequestHandled) => {
                        exchange.state.enter(Phase::ResponseFilters)
                    }
                    Err(error) => exchange.state.deferred_error = Some(error),
                })
            }
            Suspension::Route(pending) => {
                self.await_pending(exchange, pending, |exchange, result| match result {
                    Ok(()) => exchange.state.enter(Phase::ResponseFilters),
                    Err(error) => exchange.state.deferred_error = Some(error),
                })
            }
        }
    }

    // Parks the exchange in a task until `pending` resolves, records the
    // result on the exchange, and re-enters through `handle`.
    fn await_pending<T: Send + 'static>(
        &self,
        mut exchange: Exchange,
        pending: Pending<T>,
        record: fn(&mut Exchange, Result<T, PipelineError>),
    ) {
        let phase = exchange.phase();
        let Some(runtime) = self.runtime() else {
            record(&mut exchange, Err(PipelineError::NoRuntime));
            return self.handle(exchange);
        };

        debug!(phase = %phase, "awaiting pending result");
        let pipeline = self.clone();
        let timeout = self.inner.pending_timeout;
        runtime.spawn(async move {
            let result = resolve(pending, phase, timeout).await.and_then(|finish| {
                invoke(
                    phase,
                    || Ok(finish(&mut exchange)),
                    |source| PipelineError::Pending { phase, source },
                )
            });
            record(&mut exchange, result);
            pipeline.handle(exchange);
        });
    }

    fn runtime(&self) -> Option<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("request_filters", &self.inner.request_filters.len())
            .field("response_filters", &self.inner.response_filters.len())
            .field("router", &self.inner.router)
            .field("pending_timeout", &self.inner.pending_timeout)
            .finish()
    }
}

// Runs a user callable, turning both returned errors and panics into
// pipeline errors.
fn invoke<T>(
    phase: Phase,
    f: impl FnOnce() -> Result<T, BoxError>,
    wrap: impl FnOnce(BoxError) -> PipelineError,
) -> Result<T, PipelineError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(wrap(source)),
        Err(payload) => Err(PipelineError::Panicked {
            phase,
            message: panic_message(payload.as_ref()),
        }),
    }
}

async fn resolve<T: Send + 'static>(
    pending: Pending<T>,
    phase: Phase,
    timeout: Option<Duration>,
) -> Result<Finish<T>, PipelineError> {
    let mut task = tokio::spawn(pending.future);
    let joined = match timeout {
        Some(after) => match tokio::time::timeout(after, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(PipelineError::TimedOut { phase, after });
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(finish)) => Ok(finish),
        Ok(Err(source)) => Err(PipelineError::Pending { phase, source }),
        Err(join) if join.is_panic() => Err(PipelineError::Panicked {
            phase,
            message: panic_message(join.into_panic().as_ref()),
        }),
        Err(join) => Err(PipelineError::Pending {
            phase,
            source: Box::new(join),
        }),
    }
}

/// Configures a [`Pipeline`].
///
/// ```
/// use std::time::Duration;
/// use switchyard::pipeline::{FilterOutcome, Pipeline};
/// use switchyard::router::Router;
///
/// let router = Router::builder().build().unwrap();
/// let pipeline = Pipeline::builder(router)
///     .request_filter(|_exchange| Ok(FilterOutcome::Continue))
///     .response_filter(|exchange| {
///         exchange.response_mut().add_header("X-Served-By", "switchyard");
///         Ok(())
///     })
///     .pending_timeout(Duration::from_secs(30))
///     .build();
/// # drop(pipeline);
/// ```
pub struct PipelineBuilder {
    request_filters: Vec<Guarded<RequestFilter>>,
    response_filters: Vec<Guarded<ResponseFilter>>,
    router: Router,
    exception_handler: ExceptionHandler,
    runtime: Option<Handle>,
    pending_timeout: Option<Duration>,
}

impl PipelineBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            router,
            exception_handler: Arc::new(default_exception_handler),
            runtime: None,
            pending_timeout: None,
        }
    }

    /// Appends a request filter that applies to every exchange.
    #[must_use]
    pub fn request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<FilterOutcome, BoxError> + Send + Sync + 'static,
    {
        self.request_filters.push(Guarded {
            guard: None,
            filter: Arc::new(filter),
        });
        self
    }

    /// Appends a request filter that only runs when `guard` passes.
    #[must_use]
    pub fn request_filter_if<G, F>(mut self, guard: G, filter: F) -> Self
    where
        G: Fn(&Exchange) -> bool + Send + Sync + 'static,
        F: Fn(&mut Exchange) -> Result<FilterOutcome, BoxError> + Send + Sync + 'static,
    {
        self.request_filters.push(Guarded {
            guard: Some(Arc::new(guard)),
            filter: Arc::new(filter),
        });
        self
    }

    #[must_use]
    pub fn response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.response_filters.push(Guarded {
            guard: None,
            filter: Arc::new(filter),
        });
        self
    }

    #[must_use]
    pub fn response_filter_if<G, F>(mut self, guard: G, filter: F) -> Self
    where
        G: Fn(&Exchange) -> bool + Send + Sync + 'static,
        F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.response_filters.push(Guarded {
            guard: Some(Arc::new(guard)),
            filter: Arc::new(filter),
        });
        self
    }

    #[must_use]
    pub fn exception_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&PipelineError, &mut Exchange) + Send + Sync + 'static,
    {
        self.exception_handler = Arc::new(handler);
        self
    }

    /// Runtime that awaits pending results. Without one, the runtime of the
    /// suspending thread is used.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Upper bound for every pending result; elapsing is reported as
    /// [`PipelineError::TimedOut`]. No bound by default.
    #[must_use]
    pub fn pending_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.pending_timeout = timeout.into();
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            inner: Arc::new(Inner {
                request_filters: self.request_filters,
                response_filters: self.response_filters,
                router: self.router,
                exception_handler: self.exception_handler,
                runtime: self.runtime,
                pending_timeout: self.pending_timeout,
            }),
        }
    }
}
