//! CGI program execution: resolve a script under the configured root, run
//! it with a CGI/1.1 environment, and relay its output through the
//! response.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rgi_core::{Handler, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::config::ScriptsConfig;

pub struct ScriptHandler {
    root: PathBuf,
    /// Canonicalized root for containment checks.
    canonical_root: PathBuf,
    timeout: Duration,
    env_passthrough: Vec<String>,
    max_output_bytes: usize,
    max_stderr_bytes: usize,
}

impl ScriptHandler {
    pub fn new(config: &ScriptsConfig) -> Result<Self> {
        let canonical_root = config.root.canonicalize().map_err(|e| {
            anyhow!(
                "failed to canonicalize script root '{}': {}",
                config.root.display(),
                e
            )
        })?;
        Ok(Self {
            root: config.root.clone(),
            canonical_root,
            timeout: Duration::from_millis(config.timeout_ms),
            env_passthrough: config.env_passthrough.clone(),
            max_output_bytes: config.max_output_bytes,
            max_stderr_bytes: config.max_stderr_bytes,
        })
    }

    /// Resolve the script from the request path, enforcing root containment.
    fn resolve_script_path(&self, path: &str) -> Result<PathBuf> {
        let relative = path.strip_prefix('/').unwrap_or(path);
        if relative.is_empty() || relative.contains("..") {
            return Err(anyhow!("invalid script path"));
        }
        let script_path = self.root.join(relative);
        if !script_path.exists() {
            return Err(anyhow!("script not found: {}", script_path.display()));
        }
        // Canonicalize to resolve symlinks before the containment check.
        let canonical = script_path.canonicalize()?;
        if !canonical.starts_with(&self.canonical_root) {
            return Err(anyhow!(
                "script path escapes root: {}",
                canonical.display()
            ));
        }
        Ok(canonical)
    }

    /// CGI/1.1 environment for the child: the request's own parameter map,
    /// topped up with the variables rgid owns.
    fn build_env(&self, req: &Request) -> HashMap<String, String> {
        let mut env = req.params.clone();
        env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
        env.insert("SERVER_SOFTWARE".into(), format!("rgid/{}", env!("CARGO_PKG_VERSION")));
        env.entry("SERVER_PROTOCOL".into())
            .or_insert_with(|| "HTTP/1.1".into());
        for var in &self.env_passthrough {
            if let Ok(val) = std::env::var(var) {
                env.insert(var.clone(), val);
            }
        }
        env
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn handle(&self, req: Request, res: &mut Response) -> Result<()> {
        let script_path = match self.resolve_script_path(&req.path) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %req.path, error = %e, "script resolution failed");
                res.status(404)?;
                res.content_type("text")?;
                res.write("script not found").await?;
                res.end().await?;
                return Ok(());
            }
        };

        let env = self.build_env(&req);
        let output = match self.run_script(&script_path, &env, req.raw_body.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(script = %script_path.display(), error = %e, "execution failed");
                res.status(502)?;
                res.content_type("text")?;
                res.write(format!("gateway error: {e}")).await?;
                res.end().await?;
                return Ok(());
            }
        };

        let parsed = CgiOutput::parse(&output)?;
        res.status(parsed.status)?;
        for (name, value) in parsed.headers {
            res.append_header(name, value)?;
        }
        res.write(parsed.body).await?;
        res.end().await?;
        Ok(())
    }
}

impl ScriptHandler {
    async fn run_script(
        &self,
        script_path: &PathBuf,
        env: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<Vec<u8>> {
        let mut child = Command::new(script_path)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn script: {e}"))?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("child stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("child stderr unavailable"))?;

        let max_output = self.max_output_bytes;
        let max_stderr = self.max_stderr_bytes;
        let run = async {
            let feed = async {
                if !body.is_empty() {
                    // A script may exit without draining stdin; that is not
                    // an execution failure.
                    let _ = stdin.write_all(&body).await;
                }
                drop(stdin);
            };
            let (_, out, err, status) = tokio::join!(
                feed,
                read_capped(stdout, max_output, "stdout"),
                read_capped(stderr, max_stderr, "stderr"),
                child.wait(),
            );
            Ok::<_, anyhow::Error>((out?, err?, status?))
        };

        let timed = timeout(self.timeout, run).await;
        let (out, err, status) = match timed {
            Ok(res) => res?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(5), child.wait()).await;
                return Err(anyhow!("script timed out after {:?}", self.timeout));
            }
        };

        if !err.is_empty() {
            warn!(
                script = %script_path.display(),
                stderr = %String::from_utf8_lossy(&err),
                "script stderr"
            );
        }
        if !status.success() {
            warn!(
                script = %script_path.display(),
                exit_code = status.code(),
                "script exited with error"
            );
        }
        Ok(out)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    label: &'static str,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > limit {
            return Err(anyhow!("script {label} exceeded {limit} byte limit"));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Parsed CGI output: Status pseudo-header, header lines, body.
struct CgiOutput {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl CgiOutput {
    fn parse(data: &[u8]) -> Result<Self> {
        let (header_end, sep_len) = find_header_boundary(data)
            .ok_or_else(|| anyhow!("script output has no header boundary"))?;
        let header_section = std::str::from_utf8(&data[..header_end])
            .map_err(|_| anyhow!("script headers are not UTF-8"))?;

        let mut status = 200u16;
        let mut headers = Vec::new();
        for line in header_section.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("Status") {
                if let Some(code) = value.split_whitespace().next() {
                    status = code.parse().unwrap_or(200);
                }
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }
        Ok(CgiOutput {
            status,
            headers,
            body: Bytes::copy_from_slice(&data[header_end + sep_len..]),
        })
    }
}

fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}
