//! Inbound requests: parsed from the wire with [`httparse`], or built in
//! memory by embedders that do their own framing.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors raised while parsing a request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete; more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A single HTTP/1.x request as seen by the pipeline.
///
/// ```
/// use switchyard::http::{Method, Request};
///
/// let raw = b"GET /users/42?verbose=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _) = Request::parse(raw).unwrap();
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/users/42");
/// assert_eq!(request.query_param("verbose"), Some("1"));
///
/// let built = Request::builder(Method::Post, "/users").header("X-Id", "7").build();
/// assert_eq!(built.headers().get("x-id"), Some("7"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    query_params: HashMap<String, String>,
    body: Bytes,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Parses a request head out of `buf`.
    ///
    /// Returns the request and the offset where the body starts. The body is
    /// whatever follows the head in `buf`; callers that frame by
    /// `Content-Length` attach the exact slice with [`Request::with_body`].
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let target = raw.path.ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut builder = Request::builder(method_from(method), target).version(version);
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                builder = builder.header(header.name, value);
            }
        }

        let request = builder
            .body(Bytes::copy_from_slice(&buf[body_offset..]))
            .build();
        Ok((request, body_offset))
    }

    /// Starts an in-memory request. `target` may carry a query string.
    pub fn builder(method: Method, target: impl AsRef<str>) -> RequestBuilder {
        RequestBuilder::new(method, target.as_ref())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path the router matches against: the request path with any
    /// trailing slash removed (the root stays `/`).
    pub fn relative_path(&self) -> &str {
        trim_trailing_slash(&self.path)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replaces the body, typically with the exact `Content-Length` slice.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// HTTP/1.1 keeps connections open unless told otherwise; HTTP/1.0 closes
    /// unless `Connection: keep-alive` is present.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }
}

/// Builder returned by [`Request::builder`].
#[derive(Debug)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        let query_params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Self {
            request: Request {
                method,
                path,
                version: 1,
                headers: Headers::new(),
                query,
                query_params,
                body: Bytes::new(),
            },
        }
    }

    #[must_use]
    pub fn version(mut self, minor: u8) -> Self {
        self.request.version = minor;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

fn method_from(token: &str) -> Method {
    match token.parse() {
        Ok(method) => method,
        Err(never) => match never {},
    }
}

pub(crate) fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// `+` is decoded as a space; percent escapes are left as-is.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/");
        assert_eq!(req.relative_path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_splits_query() {
        let raw = b"GET /search?q=rust+lang&page=2 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn relative_path_drops_trailing_slash() {
        let req = Request::builder(Method::Get, "/users/").build();
        assert_eq!(req.path(), "/users/");
        assert_eq!(req.relative_path(), "/users");
    }

    #[test]
    fn keep_alive_rules() {
        let req = Request::builder(Method::Get, "/").build();
        assert!(req.is_keep_alive());

        let req = Request::builder(Method::Get, "/")
            .header("Connection", "close")
            .build();
        assert!(!req.is_keep_alive());

        let req = Request::builder(Method::Get, "/").version(0).build();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn content_length_and_body_offset() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&raw[offset..], b"hello");
    }
}
