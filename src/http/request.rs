use crate::error::{ClientError, Result};
use crate::pool::Destination;
use std::collections::HashMap;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }

    /// Whether a request with this method normally carries a body.
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::POST | Method::PUT | Method::PATCH)
    }
}

/// An outgoing request.
///
/// The destination selects the pool bucket the request borrows a connection
/// from; `path` is the origin-form target written on the request line.
#[derive(Debug, Clone)]
pub struct Request {
    pub destination: Destination,
    pub method: Method,
    /// Path and query (e.g., "/search?q=rust")
    pub path: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Builder for constructing Request objects.
#[derive(Default)]
pub struct RequestBuilder {
    destination: Option<Destination>,
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set destination and path from an absolute URL.
    pub fn url(mut self, url: &str) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| ClientError::InvalidRequest(format!("invalid URL {}: {}", url, e)))?;
        self.destination = Some(Destination::from_url(&url)?);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        self.path = Some(path);
        Ok(self)
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Method defaults to GET and version to HTTP/1.1; destination is required.
    pub fn build(self) -> Result<Request> {
        let destination = self
            .destination
            .ok_or_else(|| ClientError::InvalidRequest("destination missing".to_string()))?;

        Ok(Request {
            destination,
            method: self.method.unwrap_or(Method::GET),
            path: self.path.unwrap_or_else(|| "/".to_string()),
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Request {
    /// Shorthand for a GET of an absolute URL.
    pub fn get(url: &str) -> Result<Self> {
        RequestBuilder::new().url(url)?.method(Method::GET).build()
    }

    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the caller allows the connection to be reused afterwards.
    ///
    /// An explicit `Connection: close` opts the request out of pooling.
    pub fn keep_alive(&self) -> bool {
        !self
            .header("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}
