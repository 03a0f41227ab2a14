use anyhow::{anyhow, Result};
use rgi_core::ServerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level rgid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RgidConfig {
    /// Listen address — TCP ("127.0.0.1:9000") or Unix socket
    /// ("unix:///run/rgid.sock").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Maximum concurrent requests advertised to the front-end.
    #[serde(default = "default_max_reqs")]
    pub max_reqs: usize,

    /// Maximum PARAMS buffer size per request (bytes).
    #[serde(default = "default_max_params_bytes")]
    pub max_params_bytes: usize,

    /// Maximum STDIN body size per request (bytes).
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,

    /// Allow binding to non-loopback TCP addresses.
    ///
    /// rgid executes programs; exposing it to an untrusted network is
    /// unsafe.
    #[serde(default)]
    pub allow_insecure_tcp: bool,

    pub scripts: ScriptsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptsConfig {
    /// Directory holding the CGI programs. Requests resolve below it.
    pub root: PathBuf,

    /// Per-execution wall-clock limit (ms).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Host environment variables passed through to scripts.
    #[serde(default)]
    pub env_passthrough: Vec<String>,

    /// Maximum stdout size per execution (bytes).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Maximum stderr capture per execution (bytes).
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_max_conns() -> usize {
    100
}

fn default_max_reqs() -> usize {
    100
}

fn default_max_params_bytes() -> usize {
    1_048_576 // 1 MiB
}

fn default_max_stdin_bytes() -> usize {
    33_554_432 // 32 MiB
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_output_bytes() -> usize {
    33_554_432 // 32 MiB
}

fn default_max_stderr_bytes() -> usize {
    1_048_576 // 1 MiB
}

impl RgidConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scripts.timeout_ms == 0 {
            return Err(anyhow!("scripts.timeout_ms must be >= 1"));
        }
        if self.scripts.max_output_bytes == 0 {
            return Err(anyhow!("scripts.max_output_bytes must be >= 1"));
        }
        self.server_config().validate()?;

        if self.listen.starts_with("unix://") {
            return Ok(());
        }
        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        if !addr.ip().is_loopback() && !self.allow_insecure_tcp {
            return Err(anyhow!(
                "refusing to bind rgid to non-loopback address '{}' without allow_insecure_tcp=true",
                self.listen
            ));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen.clone(),
            max_conns: self.max_conns,
            max_reqs: self.max_reqs,
            max_params_bytes: self.max_params_bytes,
            max_stdin_bytes: self.max_stdin_bytes,
        }
    }
}

pub fn load_config(path: &Path) -> Result<RgidConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: RgidConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
