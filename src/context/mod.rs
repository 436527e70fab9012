//! Per-request state carried through every suspension.
//!
//! An [`Exchange`] owns the request, the response being built, a typed
//! attachment store, and the pipeline's bookkeeping (phase, filter cursor,
//! selected route, fired dispatch points). It is moved, never shared: whoever
//! holds it runs the single active step for that request, so nothing in here
//! needs a lock. Everything inside is `Send`, so a resumption may happen on a
//! different thread than the suspension.

use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::{HashMap, HashSet},
    mem,
    thread::{self, ThreadId},
    time::Instant,
};

use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::http::{Method, Request, Response, StatusCode};
use crate::pipeline::Phase;
use crate::router::SelectedRoute;

/// Typed attachment store: at most one value per type.
///
/// Filters and handlers define a small newtype per piece of state they want
/// to hand downstream and use it as the key.
///
/// ```
/// use switchyard::context::Attachments;
///
/// struct UserId(u64);
///
/// let mut attachments = Attachments::new();
/// attachments.insert(UserId(7));
/// assert_eq!(attachments.get::<UserId>().map(|u| u.0), Some(7));
/// assert!(attachments.remove::<UserId>().is_some());
/// assert!(!attachments.contains::<UserId>());
/// ```
#[derive(Default)]
pub struct Attachments {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn get_or_insert_with<T, F>(&mut self, init: F) -> &mut T
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
            .expect("attachment stored under its own TypeId")
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Attachments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachments")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Decoded values of the named segments in a matched path template.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// What the router matched: the template as registered plus its parameters.
///
/// Stored as an attachment so response filters can label metrics or logs by
/// template without matching again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub template: String,
    pub params: PathParams,
}

// Pipeline bookkeeping. Only the pipeline, router, and dispatch bridge touch it.
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    pub(crate) phase: Phase,
    pub(crate) cursor: usize,
    pub(crate) selected_route: Option<SelectedRoute>,
    pub(crate) fired: HashSet<u64>,
    pub(crate) deferred_error: Option<PipelineError>,
    // Set while a dispatch offload on this thread owns the exchange.
    pub(crate) parked_on: Option<ThreadId>,
}

impl PipelineState {
    // Phases only move forward.
    pub(crate) fn enter(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

/// A request in flight: the unit the pipeline moves between threads.
#[derive(Debug)]
pub struct Exchange {
    request: Request,
    response: Response,
    attachments: Attachments,
    started_at: Instant,
    pub(crate) state: PipelineState,
    completion: Option<oneshot::Sender<Response>>,
}

impl Exchange {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::default(),
            attachments: Attachments::new(),
            started_at: Instant::now(),
            state: PipelineState::default(),
            completion: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    /// When the exchange was created.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The phase the pipeline is in (or will resume in).
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn path_match(&self) -> Option<&PathMatch> {
        self.attachments.get::<PathMatch>()
    }

    /// Value of a named segment of the matched template.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_match()?.params.get(name)
    }

    /// The template string the router matched, if any route matched.
    pub fn matched_template(&self) -> Option<&str> {
        self.path_match().map(|m| m.template.as_str())
    }

    /// Writes status and body and marks the response as started.
    pub fn send(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.response.set_status(status);
        self.response.set_body(body);
        self.response.mark_started();
    }

    /// Registers interest in the final response. The receiver resolves once
    /// the response-filter phase has run, or errors if the exchange is
    /// dropped first.
    pub fn completion(&mut self) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    pub fn into_response(mut self) -> Response {
        mem::take(&mut self.response)
    }

    pub(crate) fn complete(mut self) {
        let response = mem::take(&mut self.response);
        match self.completion.take() {
            Some(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!(
                        method = %self.request.method(),
                        path = %self.request.path(),
                        "response receiver gone before completion"
                    );
                }
            }
            None => tracing::debug!(
                method = %self.request.method(),
                path = %self.request.path(),
                "exchange completed without a completion listener"
            ),
        }
    }

    // Moves everything into a fresh exchange, leaving a husk behind.
    fn salvage(&mut self) -> Exchange {
        Exchange {
            request: mem::replace(&mut self.request, Request::builder(Method::Get, "/").build()),
            response: mem::take(&mut self.response),
            attachments: mem::take(&mut self.attachments),
            started_at: self.started_at,
            state: mem::take(&mut self.state),
            completion: self.completion.take(),
        }
    }
}

thread_local! {
    static SALVAGED: RefCell<Option<Exchange>> = const { RefCell::new(None) };
}

/// Takes the exchange a panicking dispatch offload dropped on this thread.
pub(crate) fn take_salvaged() -> Option<Exchange> {
    SALVAGED.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

impl Drop for Exchange {
    // An offload unwinding on the thread that parked the exchange leaves it
    // behind for the pipeline instead of losing the request.
    fn drop(&mut self) {
        let Some(owner) = self.state.parked_on.take() else {
            return;
        };
        if !thread::panicking() || owner != thread::current().id() {
            return;
        }
        let salvaged = self.salvage();
        let _ = SALVAGED.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = Some(salvaged);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[derive(Debug, PartialEq)]
    struct Token(&'static str);

    #[test]
    fn insert_returns_previous_value() {
        let mut a = Attachments::new();
        assert!(a.insert(Token("a")).is_none());
        assert_eq!(a.insert(Token("b")), Some(Token("a")));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn get_or_insert_with_initializes_once() {
        let mut a = Attachments::new();
        a.get_or_insert_with(Vec::<u32>::new).push(1);
        a.get_or_insert_with(Vec::<u32>::new).push(2);
        assert_eq!(a.get::<Vec<u32>>(), Some(&vec![1, 2]));
    }

    #[test]
    fn path_accessors_read_the_match() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/users/42").build());
        assert_eq!(exchange.matched_template(), None);
        assert_eq!(exchange.path_param("id"), None);

        let mut params = PathParams::new();
        params.insert("id", "42");
        exchange.attachments_mut().insert(PathMatch {
            template: "/users/{id}".to_owned(),
            params,
        });
        assert_eq!(exchange.matched_template(), Some("/users/{id}"));
        assert_eq!(exchange.path_param("id"), Some("42"));
    }

    #[test]
    fn send_marks_response_started() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/").build());
        assert!(!exchange.response().is_started());
        exchange.send(StatusCode::Accepted, "queued");
        assert!(exchange.response().is_started());
        assert_eq!(exchange.response().status(), StatusCode::Accepted);
        assert_eq!(exchange.into_response().body_bytes(), b"queued");
    }

    #[test]
    fn phases_never_move_backwards() {
        let mut state = PipelineState::default();
        state.enter(Phase::ResponseFilters);
        state.enter(Phase::Router);
        assert_eq!(state.phase, Phase::ResponseFilters);
    }

    #[tokio::test]
    async fn completion_delivers_the_response() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/").build());
        let rx = exchange.completion();
        exchange.send(StatusCode::Ok, "done");
        exchange.complete();
        let response = rx.await.unwrap();
        assert_eq!(response.body_bytes(), b"done");
    }

    #[tokio::test]
    async fn dropped_exchange_closes_completion() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/").build());
        let rx = exchange.completion();
        drop(exchange);
        assert!(rx.await.is_err());
    }

    #[test]
    fn parked_exchange_is_salvaged_when_dropped_by_a_panic() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/parked").build());
        let _rx = exchange.completion();
        exchange.attachments_mut().insert(Token("kept"));
        exchange.state.parked_on = Some(thread::current().id());

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _owned = exchange;
            panic!("offload failed");
        }));
        assert!(unwound.is_err());

        let salvaged = take_salvaged().unwrap();
        assert_eq!(salvaged.request().path(), "/parked");
        assert_eq!(salvaged.attachments().get::<Token>(), Some(&Token("kept")));
        assert!(salvaged.state.parked_on.is_none());
        assert!(salvaged.completion.is_some());
        drop(salvaged);
        assert!(take_salvaged().is_none());
    }

    #[test]
    fn parked_exchange_dropped_normally_is_not_salvaged() {
        let mut exchange = Exchange::new(Request::builder(Method::Get, "/").build());
        exchange.state.parked_on = Some(thread::current().id());
        drop(exchange);
        assert!(take_salvaged().is_none());
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn exchange_can_hop_threads() {
        assert_send::<Exchange>();
    }
}
