use super::connector::UpstreamConnector;
use super::handler::InterceptHandler;
use crate::ca::CertificateAuthority;
use crate::error::MitmError;
use crate::pipeline::InterceptEngine;
use crate::Result;
use hudsucker::ProxyBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// MITM listener wired to an [`InterceptEngine`].
pub struct ProxyServer {
    addr: SocketAddr,
    ca: CertificateAuthority,
    connector: UpstreamConnector,
    engine: Arc<InterceptEngine>,
    packet_limit: usize,
}

impl ProxyServer {
    pub fn new(
        addr: SocketAddr,
        ca: CertificateAuthority,
        connector: UpstreamConnector,
        engine: Arc<InterceptEngine>,
        packet_limit: usize,
    ) -> Self {
        Self {
            addr,
            ca,
            connector,
            engine,
            packet_limit,
        }
    }

    /// Serves until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting MITM proxy on {}", self.addr);
        let authority = self.ca.authority()?;
        let client = hyper::Client::builder()
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build(self.connector);
        let handler = InterceptHandler::new(self.engine, self.packet_limit);

        let proxy = ProxyBuilder::new()
            .with_addr(self.addr)
            .with_client(client)
            .with_ca(authority)
            .with_http_handler(handler.clone())
            .with_websocket_handler(handler)
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| MitmError::Network(format!("Proxy failed: {}", e)))
    }
}

/// Resolves and test-binds the listen address so bind failures surface before
/// the session reports itself started.
pub async fn resolve_listen_addr(listen: &str) -> Result<SocketAddr> {
    let addr = tokio::net::lookup_host(listen)
        .await
        .map_err(|e| MitmError::Configuration(format!("invalid listen address {}: {}", listen, e)))?
        .next()
        .ok_or_else(|| MitmError::Configuration(format!("listen address {} did not resolve", listen)))?;
    let trial = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| MitmError::Network(format!("Failed to bind {}: {}", addr, e)))?;
    let bound = trial.local_addr()?;
    drop(trial);
    Ok(bound)
}
