//! The response being built for the current request
//!
//! A growable output buffer plus a header accumulator. Request logic appends
//! freely while it runs; nothing touches the wire until the boundary commits
//! and delivers the whole response. On unwind, partially written output is
//! discarded and replaced with a classification-dependent error body, so a
//! failed request can never leak half a page.

use quay_core::FailureKind;
use smallvec::SmallVec;
use std::io::{self, Write};

const DEFAULT_STATUS: &str = "200 OK";

/// Response under construction: status line, headers, body
pub struct Response {
    status: String,
    headers: SmallVec<[(String, String); 8]>,
    body: Vec<u8>,
}

impl Response {
    /// Create an empty response with a success status
    pub fn new() -> Self {
        Response {
            status: DEFAULT_STATUS.to_string(),
            headers: SmallVec::new(),
            body: Vec::new(),
        }
    }

    /// Append text to the output buffer
    pub fn write_str(&mut self, text: &str) {
        self.body.extend_from_slice(text.as_bytes());
    }

    /// Append raw bytes to the output buffer
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Override the success status line (e.g. "201 Created")
    pub fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    /// The current status line
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Append a response header
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Append a Set-Cookie header
    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.add_header("Set-Cookie", &format!("{}={}", name, value));
    }

    /// Headers accumulated so far
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The body built so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Discard any partially written body
    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    /// Replace the body with raw bytes of the given MIME type, dropping any
    /// partial page output and any previously declared Content-Type.
    pub fn set_blob(&mut self, data: &[u8], mime: &str) {
        self.body.clear();
        self.body.extend_from_slice(data);
        self.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        self.add_header("Content-Type", mime);
    }

    /// Replace everything with an error response for the given failure.
    pub fn make_error(&mut self, kind: FailureKind, message: &str) {
        self.status = kind.status_line().to_string();
        self.headers.clear();
        self.add_header("Content-Type", "text/plain");
        self.body.clear();
        self.body.extend_from_slice(message.as_bytes());
        self.body.extend_from_slice(b"\n");
    }

    /// Write the response over a connection: status line, headers, blank
    /// line, body.
    pub fn send(&self, conn: &mut impl Write) -> io::Result<()> {
        write!(conn, "HTTP/1.1 {}\r\n", self.status)?;
        for (name, value) in &self.headers {
            write!(conn, "{}: {}\r\n", name, value)?;
        }
        write!(conn, "Content-Length: {}\r\n\r\n", self.body.len())?;
        conn.write_all(&self.body)?;
        conn.flush()
    }

    /// Stream the same byte sequence through a caller-supplied callback.
    pub fn write_to(
        &self,
        mut output: impl FnMut(&[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        output(head.as_bytes())?;
        output(&self.body)
    }

    /// Back to the fresh state, retaining body capacity
    pub fn reset(&mut self) {
        self.status.clear();
        self.status.push_str(DEFAULT_STATUS);
        self.headers.clear();
        self.body.clear();
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
