//! The mutable response accumulator and its wire serialization.
//!
//! A [`Response`] buffers status, headers, and cookies until the first body
//! write, then streams through a [`ResponseSink`]: the CGI driver sinks raw
//! bytes to stdout, the FastCGI engine frames them into STDOUT records.
//! Both transports emit the same `Status:` header block.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;

use crate::error::ResponseError;

/// Matches the JavaScript `encodeURIComponent` set: alphanumerics and
/// `- _ . ! ~ * ' ( )` pass through, everything else is escaped.
const COOKIE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Where serialized response bytes go.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Terminate the response stream. For FastCGI this emits the zero-length
    /// STDOUT record and the END_REQUEST record; for CGI it flushes stdout.
    async fn finish(&mut self) -> io::Result<()>;
}

/// Attributes for [`Response::cookie`].
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub max_age: Option<i64>,
    pub expires: Option<SystemTime>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// Body argument for [`Response::send`].
#[derive(Debug)]
pub enum Payload {
    Empty,
    Text(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::Empty
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(b))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    headers_sent: bool,
    finished: bool,
    sink: Box<dyn ResponseSink>,
}

impl Response {
    pub fn new(sink: Box<dyn ResponseSink>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            headers_sent: false,
            finished: false,
            sink,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Set the status code. Fails once the header block has been serialized.
    pub fn status(&mut self, code: u16) -> Result<&mut Self, ResponseError> {
        self.check_mutable()?;
        self.status = code;
        Ok(self)
    }

    /// Set a header, replacing any previous value under the same name
    /// (case-insensitive).
    pub fn header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, ResponseError> {
        self.check_mutable()?;
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name, value));
        }
        Ok(self)
    }

    /// Add a header line without replacing earlier values; multi-valued
    /// headers emit one line per value.
    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, ResponseError> {
        self.check_mutable()?;
        self.headers.push((name.into(), value.into()));
        Ok(self)
    }

    /// Set many headers at once.
    pub fn headers<N, V>(
        &mut self,
        pairs: impl IntoIterator<Item = (N, V)>,
    ) -> Result<&mut Self, ResponseError>
    where
        N: Into<String>,
        V: Into<String>,
    {
        for (name, value) in pairs {
            self.header(name, value)?;
        }
        Ok(self)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Set the Content-Type from a shorthand key, or verbatim for anything
    /// not in the table.
    pub fn content_type(&mut self, key: &str) -> Result<&mut Self, ResponseError> {
        let value = match key {
            "html" => "text/html; charset=utf-8",
            "text" => "text/plain; charset=utf-8",
            "json" => "application/json; charset=utf-8",
            "xml" => "application/xml; charset=utf-8",
            "css" => "text/css; charset=utf-8",
            "js" => "application/javascript; charset=utf-8",
            other => other,
        };
        self.header("Content-Type", value)
    }

    /// Append a Set-Cookie line. Name and value are percent-encoded.
    pub fn cookie(
        &mut self,
        name: &str,
        value: &str,
        opts: &CookieOptions,
    ) -> Result<&mut Self, ResponseError> {
        self.check_mutable()?;
        self.cookies.push(build_cookie(name, value, opts));
        Ok(self)
    }

    /// Expire a cookie by setting an epoch Expires date.
    pub fn clear_cookie(
        &mut self,
        name: &str,
        opts: &CookieOptions,
    ) -> Result<&mut Self, ResponseError> {
        let mut opts = opts.clone();
        opts.expires = Some(UNIX_EPOCH);
        opts.max_age = None;
        self.cookie(name, "", &opts)
    }

    /// Append body bytes, serializing the header block first if it has not
    /// gone out yet.
    pub async fn write(&mut self, chunk: impl AsRef<[u8]> + Send) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }
        self.flush_headers().await?;
        let chunk = chunk.as_ref();
        if !chunk.is_empty() {
            self.sink.send(Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    /// Terminate the response. Idempotent: repeated calls produce no
    /// additional bytes.
    pub async fn end(&mut self) -> Result<(), ResponseError> {
        if self.finished {
            return Ok(());
        }
        self.flush_headers().await?;
        self.sink.finish().await?;
        self.finished = true;
        Ok(())
    }

    /// Send a body and terminate. Strings default the Content-Type to
    /// `html`, raw bytes to `application/octet-stream`, JSON values go
    /// through [`Response::json`].
    pub async fn send(&mut self, body: impl Into<Payload> + Send) -> Result<(), ResponseError> {
        match body.into() {
            Payload::Empty => self.end().await,
            Payload::Text(text) => {
                if !self.has_header("Content-Type") {
                    self.content_type("html")?;
                }
                self.write(text).await?;
                self.end().await
            }
            Payload::Binary(bytes) => {
                if !self.has_header("Content-Type") {
                    self.content_type("application/octet-stream")?;
                }
                self.write(bytes).await?;
                self.end().await
            }
            Payload::Json(value) => self.json(&value).await,
        }
    }

    /// Serialize `value` as the JSON body, with Content-Length, and
    /// terminate.
    pub async fn json<T: Serialize + Sync>(&mut self, value: &T) -> Result<(), ResponseError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ResponseError::Transport(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.content_type("json")?;
        self.header("Content-Length", body.len().to_string())?;
        self.write(body).await?;
        self.end().await
    }

    /// Redirect with status 302.
    pub async fn redirect(&mut self, url: &str) -> Result<(), ResponseError> {
        self.redirect_with_status(url, 302).await
    }

    pub async fn redirect_with_status(
        &mut self,
        url: &str,
        status: u16,
    ) -> Result<(), ResponseError> {
        self.status(status)?;
        self.header("Location", url)?;
        self.end().await
    }

    fn check_mutable(&self) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }
        if self.headers_sent {
            return Err(ResponseError::HeadersSent);
        }
        Ok(())
    }

    async fn flush_headers(&mut self) -> Result<(), ResponseError> {
        if self.headers_sent {
            return Ok(());
        }
        let head = self.serialize_head();
        self.headers_sent = true;
        self.sink.send(head).await?;
        Ok(())
    }

    fn serialize_head(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        out.extend_from_slice(
            format!("Status: {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for cookie in &self.cookies {
            out.extend_from_slice(b"Set-Cookie: ");
            out.extend_from_slice(cookie.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }
}

fn build_cookie(name: &str, value: &str, opts: &CookieOptions) -> String {
    let mut out = format!(
        "{}={}",
        utf8_percent_encode(name, COOKIE_ESCAPE),
        utf8_percent_encode(value, COOKIE_ESCAPE)
    );
    if let Some(max_age) = opts.max_age {
        out.push_str(&format!("; Max-Age={max_age}"));
    }
    if let Some(expires) = opts.expires {
        out.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
    }
    if let Some(path) = &opts.path {
        out.push_str(&format!("; Path={path}"));
    }
    if let Some(domain) = &opts.domain {
        out.push_str(&format!("; Domain={domain}"));
    }
    if opts.secure {
        out.push_str("; Secure");
    }
    if opts.http_only {
        out.push_str("; HttpOnly");
    }
    if let Some(same_site) = &opts.same_site {
        out.push_str(&format!("; SameSite={same_site}"));
    }
    out
}

pub(crate) fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
