//! One FastCGI transport connection: inbound record framing, request
//! assembly and dispatch, management records, and serialized outbound
//! writes.
//!
//! All outbound records funnel through a single writer task per connection,
//! so response bytes for one request keep their order while records for
//! different requests may interleave.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::assembler::{PendingRequest, RequestLimits};
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::handler::{self, Handler};
use crate::protocol::{
    decode_pairs, decode_record, encode_pair, write_end_request, write_record, BeginRequestBody,
    Record, FCGI_ABORT_REQUEST, FCGI_BEGIN_REQUEST, FCGI_GET_VALUES, FCGI_GET_VALUES_RESULT,
    FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, FCGI_PARAMS, FCGI_REQUEST_COMPLETE,
    FCGI_RESPONDER, FCGI_STDIN, FCGI_STDOUT, FCGI_UNKNOWN_ROLE, FCGI_UNKNOWN_TYPE,
    MAX_CONTENT_LEN,
};
use crate::request::Request;
use crate::response::{Response, ResponseSink};

#[derive(Debug)]
enum WriterMsg {
    Record {
        record_type: u8,
        request_id: u16,
        content: Bytes,
    },
    EndRequest {
        request_id: u16,
        app_status: u32,
        protocol_status: u8,
    },
}

/// Frames response bytes into STDOUT records for one request.
struct FcgiSink {
    writer_tx: mpsc::Sender<WriterMsg>,
    request_id: u16,
}

fn writer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection writer closed")
}

#[async_trait]
impl ResponseSink for FcgiSink {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let mut off = 0;
        while off < chunk.len() {
            let end = std::cmp::min(off + MAX_CONTENT_LEN, chunk.len());
            self.writer_tx
                .send(WriterMsg::Record {
                    record_type: FCGI_STDOUT,
                    request_id: self.request_id,
                    content: chunk.slice(off..end),
                })
                .await
                .map_err(|_| writer_closed())?;
            off = end;
        }
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer_tx
            .send(WriterMsg::Record {
                record_type: FCGI_STDOUT,
                request_id: self.request_id,
                content: Bytes::new(),
            })
            .await
            .map_err(|_| writer_closed())?;
        self.writer_tx
            .send(WriterMsg::EndRequest {
                request_id: self.request_id,
                app_status: 0,
                protocol_status: FCGI_REQUEST_COMPLETE,
            })
            .await
            .map_err(|_| writer_closed())
    }
}

struct Connection {
    pending: HashMap<u16, PendingRequest>,
    close_when_idle: bool,
    limits: RequestLimits,
    config: Arc<ServerConfig>,
    writer_tx: mpsc::Sender<WriterMsg>,
    handler: Arc<dyn Handler>,
    tasks: JoinSet<()>,
}

/// Drive one connection to completion.
pub(crate) async fn handle_connection<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    config: Arc<ServerConfig>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let (writer_tx, writer_rx) = mpsc::channel::<WriterMsg>(1024);
    let writer_task = tokio::spawn(write_loop(writer, writer_rx));

    let mut conn = Connection {
        pending: HashMap::new(),
        close_when_idle: false,
        limits: config.limits(),
        config,
        writer_tx,
        handler,
        tasks: JoinSet::new(),
    };

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let result = loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => break Err(ProtocolError::Transport(e)),
                };
                if n == 0 {
                    if !buf.is_empty() {
                        debug!(leftover = buf.len(), "peer closed mid-record");
                    }
                    break Ok(());
                }
                let step = loop {
                    match decode_record(&mut buf) {
                        Ok(Some(record)) => {
                            if let Err(e) = conn.on_record(record).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                };
                if let Err(e) = step {
                    break Err(e);
                }
                if conn.is_drained() {
                    break Ok(());
                }
            }
            Some(joined) = conn.tasks.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("handler task panicked");
                    }
                }
                if conn.is_drained() {
                    break Ok(());
                }
            }
        }
    };

    // Tear down: on a clean close nothing is in flight; on error or peer
    // disappearance the remaining handler tasks have lost their audience.
    conn.tasks.abort_all();
    while conn.tasks.join_next().await.is_some() {}
    drop(conn);
    let _ = writer_task.await;

    result
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> io::Result<()> {
    // Buffer small writes (record headers, header blocks) between flushes.
    let mut writer = BufWriter::with_capacity(64 * 1024, writer);
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Record {
                record_type,
                request_id,
                content,
            } => {
                write_record(&mut writer, record_type, request_id, &content).await?;
            }
            WriterMsg::EndRequest {
                request_id,
                app_status,
                protocol_status,
            } => {
                write_end_request(&mut writer, request_id, app_status, protocol_status).await?;
            }
        }
        if rx.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await
}

impl Connection {
    /// No more input will produce work and nothing is in flight.
    fn is_drained(&self) -> bool {
        self.close_when_idle && self.pending.is_empty() && self.tasks.is_empty()
    }

    async fn on_record(&mut self, record: Record) -> Result<(), ProtocolError> {
        if record.request_id() == 0 {
            return self.on_management_record(&record).await;
        }

        let request_id = record.request_id();
        match record.record_type() {
            FCGI_BEGIN_REQUEST => {
                let body = BeginRequestBody::decode(&record.content)?;
                if self.pending.contains_key(&request_id) {
                    return Err(ProtocolError::UnexpectedRecord(format!(
                        "duplicate BEGIN_REQUEST for request id {request_id}"
                    )));
                }
                if body.role != FCGI_RESPONDER {
                    debug!(role = body.role, request_id, "rejecting non-responder role");
                    self.send_end_request(request_id, 0, FCGI_UNKNOWN_ROLE).await?;
                    return Ok(());
                }
                if !body.keep_conn() {
                    self.close_when_idle = true;
                }
                self.pending
                    .insert(request_id, PendingRequest::new(body.role, body.keep_conn()));
            }
            FCGI_PARAMS | FCGI_STDIN => {
                let record_type = record.record_type();
                let Some(pending) = self.pending.get_mut(&request_id) else {
                    return Err(ProtocolError::UnexpectedRecord(format!(
                        "record type {record_type} for unknown request id {request_id}"
                    )));
                };
                let fed = if record_type == FCGI_PARAMS {
                    pending.feed_params(&record.content, &self.limits)
                } else {
                    pending.feed_stdin(&record.content, &self.limits)
                };
                match fed {
                    Ok(()) => {}
                    Err(e) if e.is_request_level() => {
                        warn!(request_id, error = %e, "dropping request");
                        self.pending.remove(&request_id);
                        self.send_end_request(request_id, 1, FCGI_REQUEST_COMPLETE).await?;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                if self.pending.get(&request_id).is_some_and(PendingRequest::is_ready) {
                    self.dispatch(request_id).await?;
                }
            }
            FCGI_ABORT_REQUEST => {
                if self.pending.remove(&request_id).is_some() {
                    debug!(request_id, "request aborted by peer");
                    self.send_end_request(request_id, 0, FCGI_REQUEST_COMPLETE).await?;
                } else {
                    // Already dispatched or never begun; the reply (if any)
                    // is owned by the running handler.
                    debug!(request_id, "abort for request not pending");
                }
            }
            other => {
                debug!(record_type = other, request_id, "ignoring record");
            }
        }
        Ok(())
    }

    /// Hand a completed request to the application.
    async fn dispatch(&mut self, request_id: u16) -> Result<(), ProtocolError> {
        let Some(pending) = self.pending.remove(&request_id) else {
            return Ok(());
        };
        let (params, body) = match pending.finish() {
            Ok(parts) => parts,
            Err(e) if e.is_request_level() => {
                warn!(request_id, error = %e, "dropping request");
                self.send_end_request(request_id, 1, FCGI_REQUEST_COMPLETE).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let request = Request::from_params(params, body);
        let sink = FcgiSink {
            writer_tx: self.writer_tx.clone(),
            request_id,
        };
        let handler = Arc::clone(&self.handler);
        self.tasks.spawn(async move {
            let mut res = Response::new(Box::new(sink));
            handler::invoke(handler.as_ref(), request, &mut res).await;
        });
        Ok(())
    }

    async fn on_management_record(&mut self, record: &Record) -> Result<(), ProtocolError> {
        match record.record_type() {
            FCGI_GET_VALUES => {
                let queried = decode_pairs(&record.content)?;
                let mut out = BytesMut::new();
                for (name, _) in &queried {
                    match name.as_str() {
                        FCGI_MAX_CONNS => encode_pair(
                            &mut out,
                            name.as_bytes(),
                            self.config.max_conns.to_string().as_bytes(),
                        ),
                        FCGI_MAX_REQS => encode_pair(
                            &mut out,
                            name.as_bytes(),
                            self.config.max_reqs.to_string().as_bytes(),
                        ),
                        FCGI_MPXS_CONNS => encode_pair(&mut out, name.as_bytes(), b"1"),
                        _ => {}
                    }
                }
                self.send_record(FCGI_GET_VALUES_RESULT, 0, out.freeze()).await
            }
            other => {
                let mut body = [0u8; 8];
                body[0] = other;
                self.send_record(FCGI_UNKNOWN_TYPE, 0, Bytes::copy_from_slice(&body))
                    .await
            }
        }
    }

    async fn send_record(
        &self,
        record_type: u8,
        request_id: u16,
        content: Bytes,
    ) -> Result<(), ProtocolError> {
        self.writer_tx
            .send(WriterMsg::Record {
                record_type,
                request_id,
                content,
            })
            .await
            .map_err(|_| ProtocolError::Transport(writer_closed()))
    }

    async fn send_end_request(
        &self,
        request_id: u16,
        app_status: u32,
        protocol_status: u8,
    ) -> Result<(), ProtocolError> {
        self.writer_tx
            .send(WriterMsg::EndRequest {
                request_id,
                app_status,
                protocol_status,
            })
            .await
            .map_err(|_| ProtocolError::Transport(writer_closed()))
    }
}
