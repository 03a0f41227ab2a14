use thiserror::Error;

/// Wire-level and request-level protocol failures.
///
/// Connection-level variants (`MalformedRecord`, `UnexpectedRecord`,
/// `Transport`) destroy the connection they occur on. Request-level variants
/// (`MalformedParams`, `RequestTooLarge`) destroy only the pending request,
/// which is answered with an END_REQUEST carrying app status 1.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("malformed params stream: {0}")]
    MalformedParams(String),

    #[error("unexpected record: {0}")]
    UnexpectedRecord(String),

    #[error("unknown role {0}")]
    UnknownRole(u16),

    #[error("request exceeds {limit} byte limit for {stream}")]
    RequestTooLarge { stream: &'static str, limit: usize },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error is contained to a single request rather than
    /// poisoning the whole connection.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedParams(_) | ProtocolError::RequestTooLarge { .. }
        )
    }
}

/// Programmer errors on the response object. These are surfaced to the
/// caller and never propagated onto the wire.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("headers already sent")]
    HeadersSent,

    #[error("response already finished")]
    AlreadyFinished,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
