use std::collections::HashMap;

/// Numeric HTTP status code of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const NOT_FOUND: StatusCode = StatusCode(404);

    /// Accepts three-digit codes in the 100..=999 range.
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(StatusCode(code))
    }

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Responses with these codes never carry a body, whatever the headers say.
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || *self == Self::NO_CONTENT || *self == Self::NOT_MODIFIED
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status line and headers of a response, as read off a connection.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP version from the status line (e.g., "HTTP/1.1")
    pub version: String,
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the server lets the connection stay open after this response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 only keeps the connection with an explicit `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(v) if v.split(',').any(|t| t.trim() == "close") => false,
            Some(v) if v.split(',').any(|t| t.trim() == "keep-alive") => true,
            _ => self.version == "HTTP/1.1",
        }
    }
}
