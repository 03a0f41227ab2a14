//! Listening endpoint and accept loop for the FastCGI transport.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::handler::Handler;

/// A FastCGI server bound to a TCP address or Unix socket.
pub struct Server {
    config: Arc<ServerConfig>,
    listener: Listener,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

/// Triggers a graceful shutdown of the server it was taken from.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting connections and destroy the open ones. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(ServerStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((ServerStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((ServerStream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

/// An accepted transport connection. Both endpoint kinds look the same to
/// the connection handler.
enum ServerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ServerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Server {
    /// Bind the configured endpoint.
    pub async fn bind(config: ServerConfig) -> Result<Server> {
        config.validate()?;
        let listener = if let Some(path) = config.listen.strip_prefix("unix://") {
            bind_unix(path)?
        } else {
            let listener = TcpListener::bind(&config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            Listener::Tcp(listener)
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Server {
            config: Arc::new(config),
            listener,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            on_shutdown: None,
        })
    }

    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run a closure once shutdown has completed and every connection is
    /// closed.
    pub fn on_shutdown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(f));
        self
    }

    /// Accept connections and surface completed requests to `handler` until
    /// shut down.
    pub async fn serve(mut self, handler: Arc<dyn Handler>) -> Result<()> {
        info!(listen = %self.config.listen, max_conns = self.config.max_conns, "listening");
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_conns));
        let mut conns: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!(peer = %peer, "too many concurrent connections; dropping");
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    let config = Arc::clone(&self.config);
                    conns.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, handler, config).await {
                            warn!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
                Some(_) = conns.join_next() => {}
            }
        }

        info!("shutting down");
        drop(self.listener);
        conns.abort_all();
        while conns.join_next().await.is_some() {}
        if let Some(callback) = self.on_shutdown.take() {
            callback();
        }
        Ok(())
    }
}

#[cfg(not(unix))]
fn bind_unix(_path: &str) -> Result<Listener> {
    Err(anyhow!("Unix sockets are not supported on this platform"))
}

#[cfg(unix)]
fn bind_unix(path: &str) -> Result<Listener> {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    // Only remove an existing path when it is a stale Unix socket.
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            let _ = std::fs::remove_file(path);
        } else {
            return Err(anyhow!("path '{}' exists and is not a Unix socket", path));
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket {path}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(Listener::Unix(listener))
}
