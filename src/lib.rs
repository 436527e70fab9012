//! # switchyard
//!
//! Method/path routing and an interruptible, resumable request pipeline on
//! top of a small async HTTP/1.1 server.
//!
//! A [`Pipeline`] runs request filters, then the [`Router`], then response
//! filters. Any filter or handler may suspend the request, either on a
//! [`Pending`](pipeline::Pending) result or by dispatching it to another
//! execution context, and the pipeline picks up exactly where it stopped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchyard::filters::{access_log, marshaling, respond_with};
//! use switchyard::pipeline::{FilterOutcome, Pipeline, RouteOutcome};
//! use switchyard::{Exchange, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::builder()
//!         .get("/users/{id}", |exchange: &mut Exchange| {
//!             let id = exchange.path_param("id").unwrap_or_default().to_owned();
//!             respond_with(exchange, StatusCode::Ok, &serde_json::json!({ "id": id }))?;
//!             Ok(RouteOutcome::Handled)
//!         })
//!         .build()?;
//!
//!     let pipeline = Pipeline::builder(router)
//!         .request_filter(|exchange| {
//!             if exchange.request().headers().contains("authorization") {
//!                 Ok(FilterOutcome::Continue)
//!             } else {
//!                 exchange.send(StatusCode::Unauthorized, "");
//!                 Ok(FilterOutcome::RequestHandled)
//!             }
//!         })
//!         .response_filter(marshaling())
//!         .response_filter(access_log())
//!         .build();
//!
//!     Server::bind("127.0.0.1:8080").await?.serve(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod http;
pub mod pipeline;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::Exchange;
pub use error::{BoxError, PipelineError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use pipeline::{FilterOutcome, Pipeline, RouteOutcome};
pub use router::Router;
pub use server::{Server, ServerError};
