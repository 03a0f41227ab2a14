//! rgi-core: serve HTTP requests behind a front-end web server over FastCGI
//! or classic one-shot CGI.
//!
//! Application code implements [`Handler`] against the decoded [`Request`]
//! and the [`Response`] accumulator; the same handler runs unchanged under
//! both transports:
//!
//! - [`Server`] speaks the FastCGI binary protocol on a TCP port or Unix
//!   socket, multiplexing concurrent requests per connection.
//! - [`cgi::serve_once`] serves a single request from the process
//!   environment and stdin, for the one-request-per-process contract.

pub mod assembler;
pub mod cgi;
pub mod config;
mod connection;
pub mod error;
mod handler;
pub mod protocol;
mod request;
mod response;
mod server;

pub use assembler::RequestLimits;
pub use cgi::serve_once;
pub use config::ServerConfig;
pub use error::{ProtocolError, ResponseError};
pub use handler::Handler;
pub use request::{Body, QueryMap, QueryValue, Request};
pub use response::{CookieOptions, Payload, Response, ResponseSink};
pub use server::{Server, ShutdownHandle};

// The async trait macro is re-exported so downstream handler impls don't
// need their own direct dependency.
pub use async_trait::async_trait;
