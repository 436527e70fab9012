//! Request routing: map method + path template to a route handler.
//!
//! Routes are grouped by [`Method`] when the router is built and, within a
//! method, sorted by template specificity (see [`PathTemplate`]), so
//! registration order never decides between `/users/active` and
//! `/users/{id}`:
//!
//! | Template           | Example match             | Captured params                  |
//! |--------------------|---------------------------|----------------------------------|
//! | `/users`           | `/users`                  | *(none)*                         |
//! | `/users/{id}`      | `/users/42`               | `id → "42"`                      |
//! | `/files/*`         | `/files/docs/readme.txt`  | `wildcard → "/docs/readme.txt"`  |
//!
//! The first route whose guard passes and whose template matches wins. Its
//! [`PathMatch`] is attached to the exchange and the route is remembered, so
//! a handler that dispatched to another execution context is re-invoked
//! directly when the pipeline comes back instead of being matched again.

mod template;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::context::{Exchange, PathMatch};
use crate::error::BoxError;
use crate::http::{Method, StatusCode};
use crate::pipeline::{Guard, RouteOutcome};

pub use template::{PathTemplate, TemplateError, WILDCARD_PARAM};

/// Type-erased route handler.
pub type RouteHandler =
    Arc<dyn Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static>;

pub(crate) fn erase<H>(handler: H) -> RouteHandler
where
    H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// The route chosen for an exchange, remembered across suspensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectedRoute {
    Route { method: Method, index: usize },
    NotFound,
}

/// One registered route.
pub struct Route {
    method: Method,
    template: PathTemplate,
    guard: Option<Guard>,
    handler: RouteHandler,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    fn admits(&self, exchange: &Exchange) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard(exchange))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("template", &self.template.as_str())
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Immutable method + path router.
///
/// ```
/// use switchyard::router::Router;
/// use switchyard::pipeline::RouteOutcome;
/// use switchyard::http::StatusCode;
///
/// let router = Router::builder()
///     .get("/users/{id}", |exchange: &mut switchyard::Exchange| {
///         let id = exchange.path_param("id").unwrap_or_default().to_owned();
///         exchange.send(StatusCode::Ok, id);
///         Ok(RouteOutcome::Handled)
///     })
///     .build()
///     .unwrap();
/// assert_eq!(router.len(), 1);
/// ```
pub struct Router {
    routes: HashMap<Method, Vec<Route>>,
    not_found: RouteHandler,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes registered for `method`, in matching order.
    pub fn routes_for(&self, method: &Method) -> &[Route] {
        self.routes.get(method).map(Vec::as_slice).unwrap_or_default()
    }

    /// Routes the exchange and invokes the selected handler.
    ///
    /// On re-entry after a dispatch the previously selected route (or the
    /// not-found handler) runs again without re-evaluating guards or
    /// templates. Handler errors are returned untouched for the pipeline to
    /// report.
    pub fn apply(&self, exchange: &mut Exchange) -> Result<RouteOutcome, BoxError> {
        if let Some(selected) = exchange.state.selected_route.clone() {
            debug!(route = ?selected, "re-entering previously selected route");
            return match &selected {
                SelectedRoute::Route { method, index } => {
                    match self.routes.get(method).and_then(|routes| routes.get(*index)) {
                        Some(route) => (route.handler)(exchange),
                        None => (self.not_found)(exchange),
                    }
                }
                SelectedRoute::NotFound => (self.not_found)(exchange),
            };
        }

        let method = exchange.request().method().clone();
        if let Some(routes) = self.routes.get(&method) {
            for (index, route) in routes.iter().enumerate() {
                if !route.admits(exchange) {
                    continue;
                }
                let Some(params) = route.template.matches(exchange.request().relative_path())
                else {
                    continue;
                };

                debug!(
                    method = %method,
                    path = %exchange.request().path(),
                    template = %route.template,
                    "route matched"
                );
                exchange.attachments_mut().insert(PathMatch {
                    template: route.template.as_str().to_owned(),
                    params,
                });
                exchange.state.selected_route = Some(SelectedRoute::Route {
                    method: method.clone(),
                    index,
                });
                return (route.handler)(exchange);
            }
        }

        debug!(method = %method, path = %exchange.request().path(), "no route matched");
        exchange.state.selected_route = Some(SelectedRoute::NotFound);
        (self.not_found)(exchange)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Sends `404 Not Found` with the reason phrase as body.
pub fn default_not_found(exchange: &mut Exchange) -> Result<RouteOutcome, BoxError> {
    let status = StatusCode::NotFound;
    exchange.send(status, status.canonical_reason());
    Ok(RouteOutcome::Handled)
}

/// Collects routes and produces a [`Router`].
pub struct RouterBuilder {
    routes: Vec<(Method, String, Option<Guard>, RouteHandler)>,
    not_found: RouteHandler,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            not_found: erase(default_not_found),
        }
    }

    /// Registers `handler` for `method` requests whose path matches `template`.
    #[must_use]
    pub fn add<H>(self, method: Method, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.push(method, template, None, erase(handler))
    }

    /// Like [`add`](Self::add), but the route is only considered when `guard`
    /// returns `true`.
    #[must_use]
    pub fn add_guarded<G, H>(
        self,
        method: Method,
        template: &str,
        guard: G,
        handler: H,
    ) -> Self
    where
        G: Fn(&Exchange) -> bool + Send + Sync + 'static,
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.push(method, template, Some(Arc::new(guard)), erase(handler))
    }

    #[must_use]
    pub fn get<H>(self, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.add(Method::Get, template, handler)
    }

    #[must_use]
    pub fn post<H>(self, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.add(Method::Post, template, handler)
    }

    #[must_use]
    pub fn put<H>(self, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.add(Method::Put, template, handler)
    }

    #[must_use]
    pub fn patch<H>(self, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.add(Method::Patch, template, handler)
    }

    #[must_use]
    pub fn delete<H>(self, template: &str, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.add(Method::Delete, template, handler)
    }

    /// Replaces the handler used when nothing matches.
    #[must_use]
    pub fn not_found<H>(mut self, handler: H) -> Self
    where
        H: Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static,
    {
        self.not_found = erase(handler);
        self
    }

    fn push(
        mut self,
        method: Method,
        template: &str,
        guard: Option<Guard>,
        handler: RouteHandler,
    ) -> Self {
        self.routes
            .push((method, template.to_owned(), guard, handler));
        self
    }

    /// Compiles every template and orders the routes.
    ///
    /// # Errors
    ///
    /// The first [`TemplateError`] among the registered templates.
    pub fn build(self) -> Result<Router, TemplateError> {
        let mut routes: HashMap<Method, Vec<Route>> = HashMap::new();
        for (method, template, guard, handler) in self.routes {
            let template = PathTemplate::parse(&template)?;
            routes.entry(method.clone()).or_default().push(Route {
                method,
                template,
                guard,
                handler,
            });
        }
        // Stable: identical templates keep registration order.
        for group in routes.values_mut() {
            group.sort_by(|a, b| a.template.cmp(&b.template));
        }

        Ok(Router {
            routes,
            not_found: self.not_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn exchange(method: Method, path: &str) -> Exchange {
        Exchange::new(Request::builder(method, path).build())
    }

    fn reply(
        body: &'static str,
    ) -> impl Fn(&mut Exchange) -> Result<RouteOutcome, BoxError> + Send + Sync + 'static {
        move |exchange: &mut Exchange| -> Result<RouteOutcome, BoxError> {
            exchange.send(StatusCode::Ok, body);
            Ok(RouteOutcome::Handled)
        }
    }

    fn body(exchange: &Exchange) -> &str {
        std::str::from_utf8(exchange.response().body_bytes()).unwrap()
    }

    #[test]
    fn empty_router_sends_404() {
        let router = Router::builder().build().unwrap();
        assert!(router.is_empty());
        let mut ex = exchange(Method::Get, "/");
        assert!(matches!(router.apply(&mut ex), Ok(RouteOutcome::Handled)));
        assert_eq!(ex.response().status(), StatusCode::NotFound);
        assert_eq!(body(&ex), "Not Found");
    }

    #[test]
    fn method_must_match() {
        let router = Router::builder().get("/hello", reply("hi")).build().unwrap();
        let mut ex = exchange(Method::Post, "/hello");
        router.apply(&mut ex).unwrap();
        assert_eq!(ex.response().status(), StatusCode::NotFound);
    }

    #[test]
    fn unmatched_path_falls_through_to_not_found() {
        let router = Router::builder().get("/hello", reply("hi")).build().unwrap();
        let mut ex = exchange(Method::Get, "/world");
        router.apply(&mut ex).unwrap();
        assert_eq!(ex.response().status(), StatusCode::NotFound);
        assert_eq!(ex.matched_template(), None);
    }

    #[test]
    fn literal_beats_param_in_either_registration_order() {
        for literal_first in [true, false] {
            let builder = Router::builder();
            let builder = if literal_first {
                builder
                    .get("/users/active", reply("active"))
                    .get("/users/{id}", reply("by-id"))
            } else {
                builder
                    .get("/users/{id}", reply("by-id"))
                    .get("/users/active", reply("active"))
            };
            let router = builder.build().unwrap();

            let mut ex = exchange(Method::Get, "/users/active");
            router.apply(&mut ex).unwrap();
            assert_eq!(body(&ex), "active");
            assert_eq!(ex.matched_template(), Some("/users/active"));

            let mut ex = exchange(Method::Get, "/users/42");
            router.apply(&mut ex).unwrap();
            assert_eq!(body(&ex), "by-id");
            assert_eq!(ex.matched_template(), Some("/users/{id}"));
            assert_eq!(ex.path_param("id"), Some("42"));
        }
    }

    #[test]
    fn identical_templates_keep_registration_order() {
        let router = Router::builder()
            .get("/path", reply("first"))
            .get("/path", reply("second"))
            .build()
            .unwrap();
        let mut ex = exchange(Method::Get, "/path");
        router.apply(&mut ex).unwrap();
        assert_eq!(body(&ex), "first");
    }

    #[test]
    fn guard_is_checked_before_template() {
        let router = Router::builder()
            .add_guarded(
                Method::Get,
                "/report",
                |ex: &Exchange| ex.request().headers().contains("x-admin"),
                reply("admin"),
            )
            .get("/report", reply("public"))
            .build()
            .unwrap();

        let mut ex = exchange(Method::Get, "/report");
        router.apply(&mut ex).unwrap();
        assert_eq!(body(&ex), "public");

        let mut ex = Exchange::new(
            Request::builder(Method::Get, "/report")
                .header("X-Admin", "1")
                .build(),
        );
        router.apply(&mut ex).unwrap();
        assert_eq!(body(&ex), "admin");
    }

    #[test]
    fn selected_route_is_reused_on_reentry() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let router = Router::builder()
            .get("/jobs/{id}", move |ex: &mut Exchange| {
                counted.fetch_add(1, Ordering::SeqCst);
                ex.send(StatusCode::Ok, "job");
                Ok(RouteOutcome::Handled)
            })
            .get("/jobs/latest", reply("latest"))
            .build()
            .unwrap();

        let mut ex = exchange(Method::Get, "/jobs/7");
        router.apply(&mut ex).unwrap();
        // Re-entry goes straight to the remembered route without matching again.
        ex.attachments_mut().remove::<PathMatch>();
        router.apply(&mut ex).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(body(&ex), "job");
    }

    #[test]
    fn reentry_ignores_a_guard_that_no_longer_passes() {
        struct Hopped;

        let router = Router::builder()
            .add_guarded(
                Method::Get,
                "/jobs/{id}",
                |ex: &Exchange| !ex.attachments().contains::<Hopped>(),
                |ex: &mut Exchange| {
                    let visit = match ex.attachments_mut().insert(Hopped) {
                        Some(_) => "again",
                        None => "first",
                    };
                    ex.send(StatusCode::Ok, visit);
                    Ok(RouteOutcome::Handled)
                },
            )
            .get("/jobs/{id}", reply("fallback"))
            .build()
            .unwrap();

        let mut ex = exchange(Method::Get, "/jobs/7");
        router.apply(&mut ex).unwrap();
        assert_eq!(body(&ex), "first");

        // The guard now fails, but the remembered route still runs.
        router.apply(&mut ex).unwrap();
        assert_eq!(body(&ex), "again");
        assert_eq!(ex.matched_template(), Some("/jobs/{id}"));
    }

    #[test]
    fn custom_not_found_is_deterministic() {
        let router = Router::builder()
            .not_found(|ex: &mut Exchange| {
                ex.send(StatusCode::NotFound, format!("no route for {}", ex.request().path()));
                Ok(RouteOutcome::Handled)
            })
            .build()
            .unwrap();

        let outputs: Vec<(StatusCode, String)> = (0..2)
            .map(|_| {
                let mut ex = exchange(Method::Delete, "/missing");
                router.apply(&mut ex).unwrap();
                (ex.response().status(), body(&ex).to_owned())
            })
            .collect();
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0].1, "no route for /missing");
    }

    #[test]
    fn handler_errors_propagate() {
        let router = Router::builder()
            .get("/fail", |_: &mut Exchange| Err("handler exploded".into()))
            .build()
            .unwrap();
        let mut ex = exchange(Method::Get, "/fail");
        let err = router.apply(&mut ex).unwrap_err();
        assert_eq!(err.to_string(), "handler exploded");
    }

    #[test]
    fn build_reports_bad_templates() {
        let result = Router::builder().get("/users/{", reply("x")).build();
        assert!(matches!(result, Err(TemplateError::InvalidSegment { .. })));
    }

    #[test]
    fn routes_are_grouped_and_ordered() {
        let router = Router::builder()
            .get("/{a}", reply("a"))
            .get("/about", reply("about"))
            .post("/about", reply("post"))
            .build()
            .unwrap();
        assert_eq!(router.len(), 3);
        let order: Vec<_> = router
            .routes_for(&Method::Get)
            .iter()
            .map(|r| r.template().as_str())
            .collect();
        assert_eq!(order, vec!["/about", "/{a}"]);
        assert!(router.routes_for(&Method::Put).is_empty());
    }
}
