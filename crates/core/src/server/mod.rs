//! HTTP server hosting the JSON-RPC WebSocket endpoint.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::{
    client_events::websocket::{self, WebSocketState},
    config::Config,
    ledger::{fabric::FabricConnector, LedgerConnector},
    transport::{ConnectionCache, GrpcChannelFactory},
};

/// Listener bound to the configured address plus the routes served on it.
pub struct GatewayServer {
    listener: TcpListener,
    router: Router,
}

impl GatewayServer {
    pub async fn bind(config: &Config, connector: Arc<dyn LedgerConnector>) -> anyhow::Result<Self> {
        let socket = SocketAddr::from(&config.ws_api);
        let listener = TcpListener::bind(socket).await?;
        let state = Arc::new(WebSocketState {
            connector,
            settings: config.session_settings(),
        });
        let router = websocket::router(state)
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http());
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` resolves.
    pub async fn serve<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "gateway listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| {
                tracing::error!("Error while running gateway server: {e}");
                anyhow::Error::new(e)
            })
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Runs the gateway against the Fabric network until ctrl-c.
pub async fn serve_gateway(config: Config) -> anyhow::Result<()> {
    let cache = Arc::new(ConnectionCache::new(GrpcChannelFactory, config.cache));
    let sweeper = spawn_cache_sweeper(cache.clone(), config.cache_sweep_interval);
    let connector = Arc::new(FabricConnector::new(cache.clone()));

    let server = GatewayServer::bind(&config, connector).await?;
    let result = server
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed listening for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await;

    sweeper.abort();
    cache.close_all();
    result
}

/// Handle of a gateway started with [`serve_gateway_with`].
pub struct GatewayHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl GatewayHandle {
    /// Stops accepting connections and waits for the server task.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await?
    }
}

/// Starts the gateway in the background with a caller provided ledger connector.
pub async fn serve_gateway_with(
    config: Config,
    connector: Arc<dyn LedgerConnector>,
) -> anyhow::Result<GatewayHandle> {
    let server = GatewayServer::bind(&config, connector).await?;
    let addr = server.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));
    Ok(GatewayHandle {
        addr,
        shutdown: Some(tx),
        task,
    })
}

/// Periodically drops pooled channels older than the cache's maximum age.
fn spawn_cache_sweeper(
    cache: Arc<ConnectionCache<GrpcChannelFactory>>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // Skip the first immediate tick

        loop {
            interval.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(
                    removed,
                    remaining = cache.len(),
                    "Expired channels swept"
                );
            }
        }
    })
}
