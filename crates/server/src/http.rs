//! Local HTTP server host.

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use axum::Router;
use polystep_engine::Engine;
use polystep_engine::config::{DEFAULT_BIND_ADDRESS, validate_bind_address};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::routes;

/// Host configuration for the HTTP surface of one engine.
#[derive(Debug, Clone)]
pub struct PolystepHttpServer {
    bind_address: SocketAddr,
    engine: Engine,
}

impl PolystepHttpServer {
    /// Create a server for `engine` bound to the provided address.
    pub fn new(bind_address: SocketAddr, engine: Engine) -> Self {
        Self { bind_address, engine }
    }

    /// Create a server bound to the engine's configured `server.bindAddress`.
    pub fn from_engine(engine: Engine) -> Result<Self> {
        let bind_address = resolve_bind_address(Some(&engine.config().server.bind_address))?;
        Ok(Self::new(bind_address, engine))
    }

    pub fn router(&self) -> Router {
        routes::router(self.engine.clone())
    }

    /// Start the server and return a handle for inspection and shutdown.
    pub async fn start(self) -> Result<RunningHttpServer> {
        let cancellation_token = CancellationToken::new();
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind_address).await?;
        let bound_address = listener.local_addr()?;

        let server_handle = tokio::spawn({
            let shutdown = cancellation_token.child_token();
            async move {
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                    })
                    .await;
            }
        });
        info!(address = %bound_address, "HTTP server listening");

        Ok(RunningHttpServer {
            bind_address: bound_address,
            cancellation_token,
            server_handle,
        })
    }
}

/// Runtime handle for a running HTTP server.
#[derive(Debug)]
pub struct RunningHttpServer {
    bind_address: SocketAddr,
    cancellation_token: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl RunningHttpServer {
    /// Return the bound socket address for the running server.
    pub fn bound_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Token that stops the server when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Resolves once the server task has exited.
    pub async fn wait(self) -> Result<()> {
        self.server_handle
            .await
            .map_err(|error| anyhow!("HTTP server task failed: {error}"))
    }

    /// Stop the server and wait for it to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancellation_token.cancel();
        self.wait().await
    }
}

/// Resolve a safe local bind address, defaulting to `127.0.0.1:3111`.
pub fn resolve_bind_address(bind_address: Option<&str>) -> Result<SocketAddr> {
    let address = bind_address.unwrap_or(DEFAULT_BIND_ADDRESS);
    Ok(validate_bind_address(address)?)
}
