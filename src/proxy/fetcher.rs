//! Upstream fetch bound to a local uplink address
//!
//! Every outbound connection is opened from a socket bound to the chosen
//! uplink's IPv4 address (ephemeral port), so the kernel routes it out of
//! that interface.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{FusionError, Result};

/// The parts of an inbound request that are replayed upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Absolute `http://` target
    pub uri: Uri,
    /// End-to-end headers from the client
    pub headers: HeaderMap,
}

impl UpstreamRequest {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A fully buffered upstream response
///
/// The status is whatever the upstream sent; only transport failures are errors.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs one outbound GET from a given local address
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(
        &self,
        request: &UpstreamRequest,
        local_address: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse>;
}

/// Timeouts and limits for upstream fetches
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Resolve + bound connect
    pub connect_timeout: Duration,
    /// Hard limit for the whole exchange, including the body
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl From<&ProxyServerConfig> for FetcherConfig {
    fn from(config: &ProxyServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Interface-bound HTTP/1.1 client
pub struct UpstreamFetcher {
    config: FetcherConfig,
}

impl UpstreamFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    async fn exchange(
        &self,
        request: &UpstreamRequest,
        local_address: Ipv4Addr,
    ) -> Result<FetchedResponse> {
        let (host, port) = parse_target(&request.uri)?;

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            connect_bound(local_address, &host, port),
        )
        .await
        .map_err(|_| {
            FusionError::UpstreamConnect(format!(
                "connect to {} via {} timed out",
                format_authority(&host, port),
                local_address
            ))
        })??;

        let outbound = build_request(request, &host)?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| FusionError::UpstreamConnect(format!("Handshake failed: {}", e)))?;

        let max_body_bytes = self.config.max_body_bytes;
        let exchange = async move {
            let response = sender
                .send_request(outbound)
                .await
                .map_err(|e| FusionError::UpstreamRead(format!("Request failed: {}", e)))?;

            let (parts, body) = response.into_parts();
            let body = Limited::new(body, max_body_bytes)
                .collect()
                .await
                .map_err(|e| {
                    if e.downcast_ref::<LengthLimitError>().is_some() {
                        FusionError::UpstreamRead(format!(
                            "body exceeds {} bytes",
                            max_body_bytes
                        ))
                    } else {
                        FusionError::UpstreamRead(e.to_string())
                    }
                })?
                .to_bytes();

            Ok::<_, FusionError>(FetchedResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        // Drive the connection alongside the exchange; dropping both closes the socket.
        tokio::pin!(conn);
        tokio::pin!(exchange);
        tokio::select! {
            biased;
            result = &mut exchange => result,
            conn_result = &mut conn => match conn_result {
                Ok(()) => exchange.await,
                Err(e) => Err(FusionError::UpstreamRead(format!("Connection failed: {}", e))),
            },
        }
    }
}

#[async_trait]
impl UpstreamClient for UpstreamFetcher {
    #[instrument(skip(self, request, cancel), fields(uri = %request.uri, local = %local_address))]
    async fn fetch(
        &self,
        request: &UpstreamRequest,
        local_address: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse> {
        let limit = self.config.request_timeout;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Fetch aborted by shutdown");
                Err(FusionError::Cancelled)
            }
            result = tokio::time::timeout(limit, self.exchange(request, local_address)) => {
                result.map_err(|_| FusionError::UpstreamTimeout { after: limit })?
            }
        }
    }
}

/// Open a TCP connection to `host:port` from `local_address`
///
/// Only IPv4 destinations are tried, in resolver order.
pub async fn connect_bound(local_address: Ipv4Addr, host: &str, port: u16) -> Result<TcpStream> {
    let targets: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| FusionError::UpstreamDns(format!("{}: {}", host, e)))?
        .filter(SocketAddr::is_ipv4)
        .collect();

    if targets.is_empty() {
        return Err(FusionError::UpstreamDns(format!(
            "{} has no IPv4 address",
            host
        )));
    }

    let mut last_error = None;
    for target in targets {
        let socket = TcpSocket::new_v4()
            .map_err(|e| FusionError::UpstreamConnect(format!("socket: {}", e)))?;
        socket
            .bind(SocketAddr::from((local_address, 0)))
            .map_err(|e| {
                FusionError::UpstreamConnect(format!("bind to {} failed: {}", local_address, e))
            })?;

        match socket.connect(target).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!(%target, local = %local_address, "Upstream connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%target, local = %local_address, error = %e, "Upstream connect failed");
                last_error = Some(FusionError::UpstreamConnect(format!(
                    "connect to {} via {} failed: {}",
                    target, local_address, e
                )));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FusionError::UpstreamConnect(host.to_string())))
}

/// Parse host and port from an absolute `http://` URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(FusionError::InvalidRequest(format!(
                "unsupported scheme '{}': only http:// targets can be fetched",
                other
            )))
        }
        None => {
            return Err(FusionError::InvalidRequest(
                "absolute-form target URL required; configure this address as an HTTP proxy"
                    .to_string(),
            ))
        }
    }

    let host = uri
        .host()
        .ok_or_else(|| FusionError::InvalidRequest("Missing host in URI".to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}

/// Parse host and port from authority (for CONNECT requests)
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| FusionError::InvalidRequest("Invalid port".to_string()))?;
            (host, port)
        }
        _ => {
            return Err(FusionError::InvalidRequest(format!(
                "CONNECT target '{}' must be host:port",
                authority
            )))
        }
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_string(), port))
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn build_request(request: &UpstreamRequest, host: &str) -> Result<Request<Empty<Bytes>>> {
    let path = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder().method(Method::GET).uri(path);

    for (name, value) in &request.headers {
        if name != HOST && !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let host_header = match request.uri.port_u16() {
        Some(port) => format_authority(host, port),
        None if host.contains(':') => format!("[{}]", host),
        None => host.to_string(),
    };

    builder
        .header(HOST, host_header)
        .body(Empty::new())
        .map_err(|e| FusionError::InvalidRequest(format!("Failed to build request: {}", e)))
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{
        spawn_silent_upstream, spawn_static_upstream, spawn_upstream,
    };
    use http_body_util::Full;
    use hyper::Response;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn fetcher(request_timeout: Duration) -> UpstreamFetcher {
        UpstreamFetcher::new(FetcherConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout,
            max_body_bytes: 1024,
        })
    }

    fn target(addr: SocketAddr, path: &str) -> UpstreamRequest {
        UpstreamRequest::new(format!("http://{}{}", addr, path).parse().unwrap())
    }

    #[test]
    fn test_parse_target() {
        let uri: Uri = "http://example.com/a?b=c".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".to_string(), 80));

        let uri: Uri = "http://[::1]:8080/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("::1".to_string(), 8080));

        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            parse_target(&uri),
            Err(FusionError::InvalidRequest(_))
        ));

        let uri: Uri = "https://example.com/".parse().unwrap();
        assert!(matches!(
            parse_target(&uri),
            Err(FusionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:8443").unwrap(),
            ("::1".to_string(), 8443)
        );
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority("example.com:http").is_err());
    }

    #[test]
    fn test_build_request_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert("proxy-authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
        headers.insert(HOST, "stale.example".parse().unwrap());

        let request = UpstreamRequest::new("http://example.com:8080/p?q=1".parse().unwrap())
            .with_headers(headers);
        let built = build_request(&request, "example.com").unwrap();

        assert_eq!(built.method(), Method::GET);
        assert_eq!(built.uri(), "/p?q=1");
        assert_eq!(built.headers()[HOST], "example.com:8080");
        assert_eq!(built.headers()["accept"], "text/html");
        assert!(built.headers().get("proxy-connection").is_none());
        assert!(built.headers().get("proxy-authorization").is_none());
    }

    #[tokio::test]
    async fn test_fetch_returns_upstream_bytes() {
        let upstream = spawn_upstream(|req| {
            let body = format!("path={}", req.uri());
            Response::new(Full::new(Bytes::from(body)))
        })
        .await;

        let response = fetcher(Duration::from_secs(5))
            .fetch(&target(upstream, "/hello?x=1"), LOOPBACK, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from("path=/hello?x=1"));
    }

    #[tokio::test]
    async fn test_fetch_passes_non_2xx_through() {
        let upstream = spawn_static_upstream(StatusCode::NOT_FOUND, b"missing").await;

        let response = fetcher(Duration::from_secs(5))
            .fetch(&target(upstream, "/"), LOOPBACK, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body, Bytes::from_static(b"missing"));
        assert_eq!(response.headers["x-upstream"], "static");
    }

    #[tokio::test]
    async fn test_fetch_times_out_on_silent_upstream() {
        let upstream = spawn_silent_upstream().await;
        let started = Instant::now();

        let result = fetcher(Duration::from_millis(300))
            .fetch(&target(upstream, "/"), LOOPBACK, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FusionError::UpstreamTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher(Duration::from_secs(5))
            .fetch(&target(addr, "/"), LOOPBACK, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_fetch_from_unassigned_address_fails() {
        let upstream = spawn_static_upstream(StatusCode::OK, b"ok").await;

        let result = fetcher(Duration::from_secs(2))
            .fetch(
                &target(upstream, "/"),
                Ipv4Addr::new(192, 0, 2, 1),
                &CancellationToken::new(),
            )
            .await;

        let err = assert_err!(result);
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        static BIG: [u8; 4096] = [b'x'; 4096];
        let upstream = spawn_static_upstream(StatusCode::OK, &BIG).await;

        let result = fetcher(Duration::from_secs(5))
            .fetch(&target(upstream, "/"), LOOPBACK, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FusionError::UpstreamRead(_))));
    }

    #[tokio::test]
    async fn test_fetch_aborts_on_cancel() {
        let upstream = spawn_silent_upstream().await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fetcher(Duration::from_secs(30))
            .fetch(&target(upstream, "/"), LOOPBACK, &cancel)
            .await;

        assert!(matches!(result, Err(FusionError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_bound_uses_local_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = assert_ok!(connect_bound(LOOPBACK, "127.0.0.1", addr.port()).await);
        let (_, peer) = listener.accept().await.unwrap();

        assert_eq!(stream.local_addr().unwrap().ip(), LOOPBACK);
        assert_eq!(peer.ip(), LOOPBACK);
    }
}
