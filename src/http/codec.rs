//! HTTP/1.x wire encoding for requests and decoding of response heads.

use crate::error::{ClientError, Result};
use crate::http::request::{Method, Request};
use crate::http::response::{ResponseHead, StatusCode};
use std::collections::HashMap;

/// Headers that describe a single hop and are never forwarded from callers.
const HOP_BY_HOP: [&str; 4] = ["Keep-Alive", "Proxy-Connection", "Transfer-Encoding", "Upgrade"];

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidStatusLine,
    InvalidStatusCode,
    InvalidHeader,
    InvalidContentLength,
    InvalidEncoding,
    UnsupportedTransferEncoding,
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        ClientError::MalformedResponse(format!("{:?}", e))
    }
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body bytes follow the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// The body runs until the peer closes; the connection cannot be reused.
    CloseDelimited,
    /// The body carries a transfer coding this client does not decode. It
    /// cannot be read and the connection cannot be reused.
    Encoded,
}

impl BodyKind {
    /// Whether the connection can carry another request once this body ends.
    pub fn is_delimited(&self) -> bool {
        matches!(self, BodyKind::Empty | BodyKind::Length(_))
    }

    /// Determine the framing of a response to a request made with `method`.
    pub fn for_response(head: &ResponseHead, method: Method) -> std::result::Result<Self, ParseError> {
        if method == Method::HEAD || head.status.forbids_body() {
            return Ok(BodyKind::Empty);
        }
        if let Some(coding) = head.header("Transfer-Encoding") {
            if !coding.trim().eq_ignore_ascii_case("identity") {
                return Ok(BodyKind::Encoded);
            }
        }
        match head.header("Content-Length") {
            Some(v) => {
                let len = v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidContentLength)?;
                Ok(if len == 0 { BodyKind::Empty } else { BodyKind::Length(len) })
            }
            None => Ok(BodyKind::CloseDelimited),
        }
    }
}

/// Serialize a request for the wire.
///
/// Sets `Host` from the destination and `Content-Length` from the body.
/// Hop-by-hop headers supplied by the caller are dropped; a caller
/// `Connection` header is kept so that `Connection: close` can opt out of
/// reuse.
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    if request.path.contains(|c: char| c.is_whitespace()) {
        return Err(ClientError::InvalidRequest(format!(
            "path contains whitespace: {:?}",
            request.path
        )));
    }
    let path = if request.path.is_empty() { "/" } else { &request.path };

    let mut buffer = Vec::with_capacity(256 + request.body.len());
    buffer.extend_from_slice(
        format!("{} {} {}\r\n", request.method.as_str(), path, request.version).as_bytes(),
    );

    let mut headers: Vec<(&str, String)> = vec![("Host", request.destination.authority())];
    for (key, value) in &request.headers {
        if key.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(ClientError::InvalidRequest(format!("invalid header: {}", key)));
        }
        let skip = key.eq_ignore_ascii_case("Host")
            || key.eq_ignore_ascii_case("Content-Length")
            || HOP_BY_HOP.iter().any(|h| key.eq_ignore_ascii_case(h));
        if !skip {
            headers.push((key.as_str(), value.clone()));
        }
    }
    if !request.body.is_empty() || request.method.expects_body() {
        headers.push(("Content-Length", request.body.len().to_string()));
    }

    for (key, value) in &headers {
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    Ok(buffer)
}

/// Offset of the `\r\n\r\n` terminating a head, if the buffer holds one.
pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a status line and header block (without the trailing blank line).
pub fn parse_response_head(head: &[u8]) -> std::result::Result<ResponseHead, ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatusLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStatusLine)?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::InvalidStatusLine);
    }
    let code = parts
        .next()
        .filter(|c| c.len() == 3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or(ParseError::InvalidStatusCode)?;
    let status = StatusCode::from_u16(code).ok_or(ParseError::InvalidStatusCode)?;

    let mut headers = HashMap::new();
    let mut content_length: Option<u64> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if key.is_empty() || key.ends_with(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }
        if key.eq_ignore_ascii_case("Content-Length") {
            // Repeated or listed lengths must all agree, otherwise the body
            // boundary is ambiguous.
            for part in value.split(',') {
                let len = part
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidContentLength)?;
                if content_length.is_some_and(|seen| seen != len) {
                    return Err(ParseError::InvalidContentLength);
                }
                content_length = Some(len);
            }
            continue;
        }
        headers.insert(key.to_string(), value.trim().to_string());
    }
    if let Some(len) = content_length {
        headers.insert("Content-Length".to_string(), len.to_string());
    }

    Ok(ResponseHead {
        version: version.to_string(),
        status,
        headers,
    })
}
