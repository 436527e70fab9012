//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, frames HTTP/1.1 requests, and hands each one to a
//! handler, usually a [`Pipeline`]. Supports HTTP/1.1 persistent connections
//! (keep-alive) out of the box.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::pipeline::Pipeline;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_request_size: usize,
    initial_buffer_size: usize,
}

/// The switchyard HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::config::ServerConfig;
/// use switchyard::pipeline::{Pipeline, RouteOutcome};
/// use switchyard::router::Router;
/// use switchyard::server::Server;
/// use switchyard::{Exchange, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::default().apply_env_overrides()?;
///     let router = Router::builder()
///         .get("/hello/{name}", |exchange: &mut Exchange| {
///             let greeting = format!("Hello, {}!", exchange.path_param("name").unwrap_or("you"));
///             exchange.send(StatusCode::Ok, greeting);
///             Ok(RouteOutcome::Handled)
///         })
///         .build()?;
///     let pipeline = Pipeline::builder(router)
///         .pending_timeout(config.pending_timeout())
///         .build();
///
///     Server::bind_with(&config).await?.serve(pipeline).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limits: Limits,
}

impl Server {
    /// Binds to `addr` with default limits.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let config = ServerConfig {
            bind_addr: addr.as_ref().to_owned(),
            ..ServerConfig::default()
        };
        Self::bind_with(&config).await
    }

    /// Binds to `config.bind_addr` and applies the configured limits.
    pub async fn bind_with(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr.as_str();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            limits: Limits {
                max_request_size: config.max_request_size,
                initial_buffer_size: config.initial_buffer_size,
            },
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs every request through `pipeline`.
    pub async fn serve(self, pipeline: Pipeline) -> Result<(), ServerError> {
        self.run(move |request| {
            let pipeline = pipeline.clone();
            async move { pipeline.serve(request).await }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks, so it must be `Send + Sync + 'static`. Runs until the
    /// process is terminated.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "switchyard listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let limits = self.limits;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, limits).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

async fn reject(stream: &mut TcpStream, status: StatusCode, body: String) -> std::io::Result<()> {
    let response = Response::new(status).body(body).keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or either side
/// signals `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    limits: Limits,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(limits.initial_buffer_size);

    loop {
        // Pipelined requests may already be buffered; only read when the
        // buffer does not hold a complete one.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (request, body_offset) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > limits.max_request_size {
                    warn!(peer = %peer_addr, "request head too large; sending 413");
                    reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large".into()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request; sending 400");
                reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                break;
            }
        };

        let declared = request.content_length().unwrap_or(0);
        let total_needed = match body_offset.checked_add(declared) {
            Some(total) if total <= limits.max_request_size => total,
            _ => {
                warn!(peer = %peer_addr, declared, "request too large; sending 413");
                reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large".into()).await?;
                break;
            }
        };

        // Wait for the full body to arrive.
        while buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                return Ok(());
            }
        }

        let frame = buf.split_to(total_needed).freeze();
        let request = request.with_body(frame.slice(body_offset..));
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut response = handler(request).await;
        if !keep_alive {
            response.set_keep_alive(false);
        }
        let close = !response.is_keep_alive();
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if close {
            debug!(peer = %peer_addr, "Connection: close; shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Exchange;
    use crate::dispatch::DispatchBridge;
    use crate::filters::{marshaling, respond_with};
    use crate::pipeline::RouteOutcome;
    use crate::router::Router;

    async fn start(config: ServerConfig) -> SocketAddr {
        let bridge = DispatchBridge::blocking(|_| Ok(()));
        let router = Router::builder()
            .post("/echo/{tag}", |exchange: &mut Exchange| {
                let tag = exchange.path_param("tag").unwrap_or_default().to_owned();
                let body = String::from_utf8_lossy(exchange.request().body()).into_owned();
                respond_with(
                    exchange,
                    StatusCode::Created,
                    &serde_json::json!({ "tag": tag, "body": body }),
                )?;
                Ok(RouteOutcome::Handled)
            })
            .get(
                "/slow",
                bridge.route_handler(|exchange: &mut Exchange| {
                    exchange.send(StatusCode::Ok, "done");
                    Ok(RouteOutcome::Handled)
                }),
            )
            .build()
            .unwrap();
        let pipeline = Pipeline::builder(router)
            .response_filter(marshaling())
            .build();

        let server = Server::bind_with(&config).await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(pipeline));
        addr
    }

    fn local() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        }
    }

    async fn exchange_raw(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_a_pipeline_over_tcp() {
        let addr = start(local()).await;
        let reply = exchange_raw(
            addr,
            "POST /echo/a%20b HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;

        assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"), "{reply}");
        assert!(reply.contains("Content-Type: application/json\r\n"));
        assert!(reply.ends_with(r#"{"body":"hello","tag":"a b"}"#), "{reply}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keep_alive_serves_pipelined_requests() {
        let addr = start(local()).await;
        let reply = exchange_raw(
            addr,
            "GET /slow HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;

        let first = reply.find("HTTP/1.1 200 OK").unwrap();
        let second = reply.find("HTTP/1.1 404 Not Found").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn oversized_bodies_get_413() {
        let addr = start(ServerConfig {
            max_request_size: 128,
            ..local()
        })
        .await;
        let reply = exchange_raw(
            addr,
            "POST /echo/x HTTP/1.1\r\nHost: x\r\nContent-Length: 4096\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn absurd_content_length_gets_413() {
        let addr = start(local()).await;
        let reply = exchange_raw(
            addr,
            &format!("POST /echo/x HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n", usize::MAX),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn malformed_requests_get_400() {
        let addr = start(local()).await;
        let reply = exchange_raw(addr, "NOT A REQUEST\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
    }
}
