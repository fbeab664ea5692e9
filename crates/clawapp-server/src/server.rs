//! Bridge server: wires identity, connector, registry and the HTTP router.

use crate::auth::ClientAuth;
use crate::config::ServerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionRegistry;
use crate::transport::{router, AppState, HealthInfo};
use crate::upstream::UpstreamConnector;
use clawapp_core::DeviceIdentity;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct BridgeServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl BridgeServer {
    /// Build the server around an already loaded device identity.
    pub fn new(config: ServerConfig, identity: Arc<DeviceIdentity>) -> Self {
        let connector = UpstreamConnector::new(
            config.gateway_url.clone(),
            config.gateway_token.clone(),
            identity,
            config.timings.clone(),
        );
        let auth = ClientAuth::new(config.proxy_token.as_deref());
        let registry = SessionRegistry::new(connector, auth, config.max_sessions);
        Self { config, registry }
    }

    /// Serve until `shutdown` resolves, then close every session.
    pub async fn run<F>(self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid listen address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let stop = CancellationToken::new();
        let sweeper = self.registry.spawn_sweeper(stop.clone());

        let app = router(AppState {
            registry: Arc::clone(&self.registry),
            health: Arc::new(HealthInfo {
                port: self.config.port,
                gateway_url: self.registry.connector().url().to_string(),
                has_proxy_token: self.registry.auth().is_enabled(),
                has_gateway_token: !self.config.gateway_token.is_empty(),
            }),
        });

        info!(
            addr = %addr,
            gateway = %self.config.gateway_url,
            max_sessions = self.config.max_sessions,
            "clawapp-server ready"
        );

        // Open SSE streams only end once their sessions are closed.
        let registry = Arc::clone(&self.registry);
        let signal_stop = stop.clone();
        let graceful = async move {
            shutdown.await;
            info!("shutting down, closing sessions");
            signal_stop.cancel();
            registry.shutdown().await;
        };

        let served = axum::serve(listener, app).with_graceful_shutdown(graceful).await;

        stop.cancel();
        let _ = sweeper.await;
        self.registry.shutdown().await;
        served?;
        Ok(())
    }
}
