//! The same handler as a classic CGI program: one request per process,
//! request from environment + stdin, response on stdout.

use rgi_core::{async_trait, Body, Handler, Request, Response};

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, req: Request, res: &mut Response) -> anyhow::Result<()> {
        match &req.body {
            Body::Json(value) => res.json(value).await?,
            _ => {
                res.content_type("text")?;
                res.write(format!("{} {}\n", req.method, req.path)).await?;
                res.end().await?;
            }
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    rgi_core::serve_once(&Echo).await
}
