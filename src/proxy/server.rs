//! Proxy server implementation using hyper
//!
//! Accepts loopback connections and serves each one with the session's
//! [`ProxyHandler`] until the session is cancelled.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{FusionError, Result};
use crate::proxy::handler::ProxyHandler;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy server bound to its loopback listener
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// Bind the listener on 127.0.0.1 at the configured port
    ///
    /// Binding is synchronous so a taken port is reported before the
    /// session is declared running.
    pub fn bind(config: &ProxyServerConfig, handler: Arc<ProxyHandler>) -> Result<Self> {
        let addr = config.listen_addr();
        let bind_error = |source| FusionError::Bind { addr, source };

        let socket = TcpSocket::new_v4().map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;

        Ok(Self {
            listener,
            handler,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `cancel` fires, then drain connections
    ///
    /// In-flight connections and open tunnels share `shutdown_grace` to
    /// finish before they are aborted.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let ProxyServer {
            listener,
            handler,
            shutdown_grace,
        } = self;

        info!("Proxy server listening on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                accept_result = listener.accept() => match accept_result {
                    Ok((stream, client_addr)) => {
                        debug!("Accepted connection from {}", client_addr);
                        connections.spawn(Self::handle_connection(
                            stream,
                            handler.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            "Proxy server stopped accepting, draining {} connections",
            connections.len()
        );

        let deadline = Instant::now() + shutdown_grace;
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!(
                "Connections still open after {:?}, aborting {}",
                shutdown_grace,
                connections.len()
            );
            connections.shutdown().await;
        }

        // No connection task is left to open a new tunnel
        let mut tunnels = handler.take_tunnels();
        if !tunnels.is_empty() {
            debug!("Closing {} tunnels", tunnels.len());
            let drain = async { while tunnels.join_next().await.is_some() {} };
            if tokio::time::timeout_at(deadline, drain).await.is_err() {
                warn!("Aborting {} tunnels", tunnels.len());
                tunnels.shutdown().await;
            }
        }

        info!("Proxy server stopped");
        Ok(())
    }

    /// Serve a single connection, finishing gracefully on cancel
    async fn handle_connection(
        stream: TcpStream,
        handler: Arc<ProxyHandler>,
        cancel: CancellationToken,
    ) {
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection error: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.as_mut().await {
                    debug!("Connection error during shutdown: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventSink, SessionStats, Uplink, UplinkSet};
    use crate::proxy::fetcher::{FetcherConfig, UpstreamFetcher};
    use crate::proxy::handler::ProxyHandlerConfig;
    use crate::proxy::testing::{proxy_request, spawn_static_upstream};
    use hyper::{Method, StatusCode};
    use uuid::Uuid;

    fn loopback_handler(cancel: &CancellationToken) -> Arc<ProxyHandler> {
        let uplinks = UplinkSet::new(vec![Uplink::parse("lo", "127.0.0.1").unwrap()]).unwrap();
        let stats = Arc::new(SessionStats::new(Uuid::new_v4(), &uplinks));
        Arc::new(ProxyHandler::new(
            Arc::new(uplinks),
            Arc::new(UpstreamFetcher::new(FetcherConfig::default())),
            ProxyHandlerConfig::default(),
            EventSink::default(),
            stats,
            cancel.clone(),
        ))
    }

    fn ephemeral_config() -> ProxyServerConfig {
        ProxyServerConfig {
            port: 0,
            shutdown_grace: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_until_cancelled() {
        let upstream = spawn_static_upstream(StatusCode::OK, b"hello").await;
        let cancel = CancellationToken::new();

        let server = ProxyServer::bind(&ephemeral_config(), loopback_handler(&cancel)).unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        let task = tokio::spawn(server.run(cancel.clone()));

        let (status, body) =
            proxy_request(addr, Method::GET, &format!("http://{}/", upstream)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let cancel = CancellationToken::new();
        let first = ProxyServer::bind(&ephemeral_config(), loopback_handler(&cancel)).unwrap();
        let taken = first.local_addr().unwrap();

        let config = ProxyServerConfig {
            port: taken.port(),
            ..ephemeral_config()
        };
        let err = ProxyServer::bind(&config, loopback_handler(&cancel))
            .err()
            .unwrap();
        assert!(matches!(err, FusionError::Bind { addr, .. } if addr.port() == taken.port()));
    }

    #[tokio::test]
    async fn test_idle_connection_closed_on_cancel() {
        let cancel = CancellationToken::new();
        let server = ProxyServer::bind(&ephemeral_config(), loopback_handler(&cancel)).unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run(cancel.clone()));

        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
