//! The application handler trait and the invocation guard around it.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::request::Request;
use crate::response::Response;

/// An application request handler.
///
/// Implementations receive one decoded request and a live response; they are
/// expected to call [`Response::end`] (directly or via `send`/`json`/
/// `redirect`), but the runtime terminates the response for them if they
/// forget.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request, res: &mut Response) -> anyhow::Result<()>;
}

/// Run the handler and enforce the response post-conditions: a failing
/// handler yields a well-formed 500 when headers are still unsent, and the
/// response stream is always terminated.
pub(crate) async fn invoke(handler: &dyn Handler, req: Request, res: &mut Response) {
    let method = req.method.clone();
    let path = req.path.clone();
    if let Err(e) = handler.handle(req, res).await {
        error!(method = %method, path = %path, error = %e, "handler failed");
        if !res.headers_sent() {
            let _ = res.status(500);
            let _ = res.content_type("text");
            let _ = res.write(format!("Internal Server Error: {e}")).await;
        }
    }
    if let Err(e) = res.end().await {
        debug!(error = %e, "response termination failed");
    }
}
