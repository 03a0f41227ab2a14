//! One-shot CGI: one process lifetime serves one request from the
//! environment and stdin, answering on stdout.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::handler::{self, Handler};
use crate::request::Request;
use crate::response::{Response, ResponseSink};

/// Methods whose stdin carries a request body (RFC 3875 semantics plus the
/// modern mutating verbs).
const BODY_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];

/// Sinks serialized response bytes straight into an async writer.
pub struct CgiSink<W> {
    out: W,
}

impl<W> CgiSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for CgiSink<W> {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        self.out.write_all(&chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

/// Serve exactly one request from the process environment, stdin, and
/// stdout. The process is expected to exit afterwards.
pub async fn serve_once(handler: &dyn Handler) -> anyhow::Result<()> {
    let params: HashMap<String, String> = std::env::vars().collect();
    serve_once_io(handler, params, tokio::io::stdin(), tokio::io::stdout()).await
}

/// [`serve_once`] with explicit transports, for embedding and tests.
pub async fn serve_once_io<R, W>(
    handler: &dyn Handler,
    params: HashMap<String, String>,
    body_in: R,
    out: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let body = read_body(&params, body_in).await?;
    let request = Request::from_params(params, body);
    let mut response = Response::new(Box::new(CgiSink::new(out)));
    handler::invoke(handler, request, &mut response).await;
    Ok(())
}

/// Read up to CONTENT_LENGTH bytes for body-carrying methods; a short
/// stream yields what was read.
async fn read_body<R: AsyncRead + Unpin>(
    params: &HashMap<String, String>,
    body_in: R,
) -> anyhow::Result<Bytes> {
    let method = params
        .get("REQUEST_METHOD")
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_default();
    if !BODY_METHODS.contains(&method.as_str()) {
        return Ok(Bytes::new());
    }
    let content_length = params
        .get("CONTENT_LENGTH")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if content_length == 0 {
        return Ok(Bytes::new());
    }
    let mut body = Vec::with_capacity(content_length.min(64 * 1024) as usize);
    body_in.take(content_length).read_to_end(&mut body).await?;
    Ok(Bytes::from(body))
}
