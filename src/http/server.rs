//! HTTP server implementation.

use axum::Router;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::{Result, TollgateError};

/// HTTP server hosting the rate limited application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Application routes, admission layer included
    app: Router,
    /// How long in-flight requests may run after shutdown is requested
    shutdown_grace: Duration,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, app: Router, shutdown_grace: Duration) -> Self {
        Self {
            addr,
            app,
            shutdown_grace,
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// Once `signal` resolves no new connections are accepted. Requests still
    /// in flight after the grace period are abandoned.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        let requested = Arc::new(Notify::new());
        let notifier = Arc::clone(&requested);
        let signal = async move {
            signal.await;
            notifier.notify_one();
        };

        let server = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .into_future();

        let grace = self.shutdown_grace;
        let deadline = async move {
            requested.notified().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Server(e.to_string())
            }),
            _ = deadline => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Shutdown grace period elapsed, dropping in-flight requests"
                );
                Ok(())
            }
        }
    }
}
