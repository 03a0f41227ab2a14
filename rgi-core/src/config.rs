use serde::Deserialize;
use std::net::SocketAddr;

use crate::assembler::RequestLimits;

/// FastCGI server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address: TCP ("127.0.0.1:9000") or Unix socket
    /// ("unix:///run/app.sock").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum concurrent client connections; also reported for
    /// FCGI_MAX_CONNS.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Maximum concurrent requests; reported for FCGI_MAX_REQS.
    #[serde(default = "default_max_reqs")]
    pub max_reqs: usize,

    /// Maximum accumulated PARAMS bytes per request.
    #[serde(default = "default_max_params_bytes")]
    pub max_params_bytes: usize,

    /// Maximum accumulated STDIN bytes per request.
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,
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

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_conns: default_max_conns(),
            max_reqs: default_max_reqs(),
            max_params_bytes: default_max_params_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_conns == 0 {
            anyhow::bail!("max_conns must be >= 1");
        }
        if self.max_reqs == 0 {
            anyhow::bail!("max_reqs must be >= 1");
        }
        if self.max_params_bytes == 0 {
            anyhow::bail!("max_params_bytes must be >= 1");
        }
        if self.max_stdin_bytes == 0 {
            anyhow::bail!("max_stdin_bytes must be >= 1");
        }
        if !self.listen.starts_with("unix://") {
            self.listen
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        }
        Ok(())
    }

    pub(crate) fn limits(&self) -> RequestLimits {
        RequestLimits {
            max_params_bytes: self.max_params_bytes,
            max_stdin_bytes: self.max_stdin_bytes,
        }
    }
}
