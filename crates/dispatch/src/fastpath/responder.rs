//! Minimal raw response writer

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Errors writing a raw response
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// A header would break the response framing
    #[error("header {0:?} contains a line break")]
    InvalidHeader(String),

    #[error("failed to write response: {0}")]
    Io(#[from] io::Error),
}

/// Status line, a few headers, and an optional body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

/// Writes responses directly to client connections, bypassing workers
///
/// Default headers are added unless the response sets the same name.
/// `Content-Length` is derived from the body when it is not given.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::fastpath::{FastPathResponder, RawResponse};
///
/// let responder = FastPathResponder::new();
/// let bytes = responder.encode(&RawResponse::new(414)).unwrap();
/// assert_eq!(bytes, b"HTTP/1.1 414 URI Too Long\r\n\r\n");
/// ```
#[derive(Debug, Clone, Default)]
pub struct FastPathResponder {
    default_headers: Vec<(String, String)>,
}

impl FastPathResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every response
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Serialize a response
    pub fn encode(&self, response: &RawResponse) -> Result<Vec<u8>, ResponseError> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            response.status,
            reason_phrase(response.status)
        );

        let defaults = self
            .default_headers
            .iter()
            .filter(|(name, _)| !response.has_header(name));
        for (name, value) in response.headers.iter().chain(defaults) {
            if has_line_break(name) || has_line_break(value) {
                return Err(ResponseError::InvalidHeader(name.clone()));
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        if let Some(body) = &response.body {
            if !response.has_header("content-length") {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if let Some(body) = &response.body {
            bytes.extend_from_slice(body);
        }
        Ok(bytes)
    }

    /// Write a response and flush it
    pub async fn respond<W>(&self, writer: &mut W, response: &RawResponse) -> Result<(), ResponseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode(response)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write a bare status response whose body is the reason phrase
    pub async fn reject<W>(&self, writer: &mut W, status: u16) -> Result<(), ResponseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let response = RawResponse::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(reason_phrase(status));
        self.respond(writer, &response).await
    }
}

fn has_line_break(text: &str) -> bool {
    text.contains(['\r', '\n'])
}

/// Reason phrase for a status code; empty for unknown codes
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        432 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
