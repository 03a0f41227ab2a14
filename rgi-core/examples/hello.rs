//! Minimal FastCGI responder. Point a front-end at 127.0.0.1:9000, e.g.
//! nginx:
//!
//! ```text
//! location / {
//!     include fastcgi_params;
//!     fastcgi_pass 127.0.0.1:9000;
//! }
//! ```

use std::sync::Arc;

use rgi_core::{async_trait, Handler, Request, Response, Server, ServerConfig};

struct Hello;

#[async_trait]
impl Handler for Hello {
    async fn handle(&self, req: Request, res: &mut Response) -> anyhow::Result<()> {
        let name = req.query.get_str("name").unwrap_or("world");
        res.json(&serde_json::json!({ "hello": name })).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server = Server::bind(ServerConfig::default()).await?;
    server.serve(Arc::new(Hello)).await
}
