//! Per-request accumulation of PARAMS and STDIN streams.
//!
//! One [`PendingRequest`] exists per (connection, request id) from
//! BEGIN_REQUEST until the request is dispatched, aborted, or its
//! connection closes. Stream ordering is permissive: STDIN content may
//! arrive before the PARAMS terminator; dispatch requires only that both
//! streams have seen their zero-length terminator record.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size limits applied while accumulating a request.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_params_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_params_bytes: 1_048_576,  // 1 MiB
            max_stdin_bytes: 33_554_432,  // 32 MiB
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest {
    role: u16,
    keep_conn: bool,
    params_buf: BytesMut,
    params_done: bool,
    stdin_buf: BytesMut,
    stdin_done: bool,
}

impl PendingRequest {
    pub fn new(role: u16, keep_conn: bool) -> Self {
        Self {
            role,
            keep_conn,
            params_buf: BytesMut::new(),
            params_done: false,
            stdin_buf: BytesMut::new(),
            stdin_done: false,
        }
    }

    pub fn role(&self) -> u16 {
        self.role
    }

    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    /// Feed the content of one PARAMS record. Zero length marks the stream
    /// terminated.
    pub fn feed_params(
        &mut self,
        content: &[u8],
        limits: &RequestLimits,
    ) -> Result<(), ProtocolError> {
        if self.params_done {
            return Err(ProtocolError::UnexpectedRecord(
                "PARAMS after stream terminator".into(),
            ));
        }
        if content.is_empty() {
            self.params_done = true;
            return Ok(());
        }
        if self.params_buf.len() + content.len() > limits.max_params_bytes {
            return Err(ProtocolError::RequestTooLarge {
                stream: "PARAMS",
                limit: limits.max_params_bytes,
            });
        }
        self.params_buf.extend_from_slice(content);
        Ok(())
    }

    /// Feed the content of one STDIN record. Zero length marks the stream
    /// terminated.
    pub fn feed_stdin(
        &mut self,
        content: &[u8],
        limits: &RequestLimits,
    ) -> Result<(), ProtocolError> {
        if self.stdin_done {
            return Err(ProtocolError::UnexpectedRecord(
                "STDIN after stream terminator".into(),
            ));
        }
        if content.is_empty() {
            self.stdin_done = true;
            return Ok(());
        }
        if self.stdin_buf.len() + content.len() > limits.max_stdin_bytes {
            return Err(ProtocolError::RequestTooLarge {
                stream: "STDIN",
                limit: limits.max_stdin_bytes,
            });
        }
        self.stdin_buf.extend_from_slice(content);
        Ok(())
    }

    /// Both streams terminated; the request may be dispatched exactly once.
    pub fn is_ready(&self) -> bool {
        self.params_done && self.stdin_done
    }

    /// Consume the accumulated state into a parameter map and body bytes.
    ///
    /// Later occurrences of a parameter name win, matching how front-ends
    /// send overriding values after route defaults.
    pub fn finish(self) -> Result<(HashMap<String, String>, Bytes), ProtocolError> {
        debug_assert!(self.is_ready());
        let pairs = crate::protocol::decode_pairs(&self.params_buf)?;
        let mut params = HashMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            params.insert(name, value);
        }
        Ok((params, self.stdin_buf.freeze()))
    }
}
