//! Proxy request handler
//!
//! Turns one inbound request into one dispatch decision and one upstream
//! fetch, and always produces a response: failures become 4xx/5xx answers
//! for that client only.

use std::any::Any;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use http_body_util::Full;
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Request, Response, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{text_response, FusionError, Result};
use crate::models::{EventSink, SessionStats, Uplink, UplinkSet};
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::fetcher::{
    connect_bound, is_hop_by_hop_header, parse_authority, parse_target, FetchedResponse,
    UpstreamClient, UpstreamRequest,
};
use crate::proxy::tunnel::TunnelHandler;

/// How much of a target URL goes into status events
const TARGET_PREVIEW_CHARS: usize = 60;

/// Configuration for proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Answer 200 for every successful fetch
    pub normalize_status: bool,
    /// Relay CONNECT tunnels instead of answering 501
    pub allow_connect: bool,
    /// Timeout for opening a tunnel's upstream connection
    pub connect_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            normalize_status: false,
            allow_connect: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ProxyServerConfig> for ProxyHandlerConfig {
    fn from(config: &ProxyServerConfig) -> Self {
        Self {
            normalize_status: config.normalize_status,
            allow_connect: config.allow_connect,
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Response plus what is reported about it
struct Handled {
    response: Response<Full<Bytes>>,
    uplink: Option<Uplink>,
    note: Option<String>,
}

impl Handled {
    fn rejected(response: Response<Full<Bytes>>) -> Self {
        Self {
            response,
            uplink: None,
            note: None,
        }
    }

    fn via(response: Response<Full<Bytes>>, uplink: Uplink) -> Self {
        Self {
            response,
            uplink: Some(uplink),
            note: None,
        }
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Proxy request handler, one per session
pub struct ProxyHandler {
    dispatcher: Dispatcher,
    upstream: Arc<dyn UpstreamClient>,
    config: ProxyHandlerConfig,
    events: EventSink,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    /// Open CONNECT relays, drained by the server on shutdown
    tunnels: Mutex<JoinSet<()>>,
}

impl ProxyHandler {
    pub fn new(
        uplinks: Arc<UplinkSet>,
        upstream: Arc<dyn UpstreamClient>,
        config: ProxyHandlerConfig,
        events: EventSink,
        stats: Arc<SessionStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(uplinks),
            upstream,
            config,
            events,
            stats,
            cancel,
            tunnels: Mutex::new(JoinSet::new()),
        }
    }

    /// Hand over the relay tasks still running
    ///
    /// Called once no connection can start another tunnel.
    pub fn take_tunnels(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.tunnels.lock())
    }

    /// Handle an incoming proxy request
    ///
    /// Never fails: internal faults, including panics, become a 500 for this
    /// request and an error event.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B: Send>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        self.stats.record_request();
        let method = req.method().clone();
        let target = describe_target(req.uri());

        let handled = match AssertUnwindSafe(self.dispatch(req)).catch_unwind().await {
            Ok(Ok(handled)) => handled,
            Ok(Err(e)) => self.internal_fault(e.to_string()),
            Err(panic) => self.internal_fault(panic_message(panic.as_ref())),
        };

        self.report(&method, &target, &handled);
        handled.response
    }

    async fn dispatch<B: Send>(&self, req: Request<B>) -> Result<Handled> {
        if self.dispatcher.available_count() == 0 {
            self.stats.record_rejected();
            return Ok(Handled::rejected(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "No uplink selected: start the proxy with at least one network interface",
            )));
        }

        match *req.method() {
            Method::GET => self.forward(req).await,
            Method::CONNECT if self.config.allow_connect => self.tunnel(req).await,
            _ => {
                debug!("Rejecting unsupported method {}", req.method());
                self.stats.record_rejected();
                Ok(Handled::rejected(
                    FusionError::UnsupportedMethod(req.method().clone()).to_response(),
                ))
            }
        }
    }

    /// Fetch a GET target through the next uplink
    async fn forward<B: Send>(&self, req: Request<B>) -> Result<Handled> {
        let (parts, _body) = req.into_parts();

        if let Err(e) = parse_target(&parts.uri) {
            self.stats.record_rejected();
            return Ok(Handled::rejected(e.to_response()));
        }

        let uplink = self.dispatcher.choose()?.clone();
        self.stats.record_dispatch(uplink.address());
        debug!(uplink = %uplink, "Dispatching GET");

        let request = UpstreamRequest::new(parts.uri).with_headers(parts.headers);
        match self
            .upstream
            .fetch(&request, uplink.address(), &self.cancel)
            .await
        {
            Ok(fetched) => {
                self.stats
                    .record_success(uplink.address(), fetched.body.len() as u64);
                Ok(Handled::via(self.relay_response(fetched), uplink))
            }
            Err(e) if e.is_transport() => {
                warn!(uplink = %uplink, error = %e, "Upstream fetch failed");
                self.stats.record_failure(uplink.address());
                let response = text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Upstream request failed: {}", e),
                );
                Ok(Handled::via(response, uplink).with_note(e.to_string()))
            }
            Err(e @ (FusionError::Cancelled | FusionError::InvalidRequest(_))) => {
                Ok(Handled::via(e.to_response(), uplink).with_note(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Open a CONNECT tunnel from the next uplink
    async fn tunnel<B: Send>(&self, mut req: Request<B>) -> Result<Handled> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let (host, port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(e) => {
                self.stats.record_rejected();
                return Ok(Handled::rejected(e.to_response()));
            }
        };

        let uplink = self.dispatcher.choose()?.clone();
        let address = uplink.address();
        self.stats.record_dispatch(address);

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            connect_bound(address, &host, port),
        );
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(FusionError::Cancelled),
            result = connect => result.unwrap_or(Err(FusionError::UpstreamTimeout {
                after: self.config.connect_timeout,
            })),
        };

        let server = match connected {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_transport() {
                    warn!(uplink = %uplink, error = %e, "CONNECT failed");
                    self.stats.record_failure(address);
                }
                let response = text_response(
                    e.status_code(),
                    &format!("Failed to establish tunnel: {}", e),
                );
                return Ok(Handled::via(response, uplink).with_note(e.to_string()));
            }
        };

        info!(uplink = %uplink, "CONNECT tunnel established to {}:{}", host, port);
        self.stats.record_success(address, 0);

        let on_upgrade = hyper::upgrade::on(&mut req);
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        {
            let mut tunnels = self.tunnels.lock();
            while tunnels.try_join_next().is_some() {}
            tunnels.spawn(async move {
                match TunnelHandler::relay(on_upgrade, server, cancel).await {
                    Ok((sent, received)) => stats.record_bytes(address, sent + received),
                    Err(e) => debug!("Tunnel ended: {}", e),
                }
            });
        }

        Ok(Handled::via(Response::new(Full::new(Bytes::new())), uplink))
    }

    /// Build the client response from a fetched upstream response
    fn relay_response(&self, fetched: FetchedResponse) -> Response<Full<Bytes>> {
        let status = if self.config.normalize_status {
            StatusCode::OK
        } else {
            fetched.status
        };

        let mut response = Response::new(Full::new(fetched.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &fetched.headers {
            if name != CONTENT_LENGTH && !is_hop_by_hop_header(name.as_str()) {
                headers.append(name, value.clone());
            }
        }

        response
    }

    fn internal_fault(&self, detail: String) -> Handled {
        error!("Request handling error: {}", detail);
        self.stats.record_fault();
        self.events.error(format!("Proxy error: {}", detail));

        Handled::rejected(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Proxy internal error",
        ))
        .with_note(detail)
    }

    /// Emit the one status event for a handled request
    fn report(&self, method: &Method, target: &str, handled: &Handled) {
        let mut message = format!(
            "{} {} -> {}",
            method,
            target,
            handled.response.status().as_u16()
        );
        if let Some(uplink) = &handled.uplink {
            let _ = write!(message, " via {}", uplink);
        }
        if let Some(note) = &handled.note {
            let _ = write!(message, ": {}", note);
        }
        self.events.status(message);
    }
}

/// Short, char-boundary safe description of a request target
pub fn describe_target(uri: &Uri) -> String {
    let full = uri.to_string();
    if full.chars().count() <= TARGET_PREVIEW_CHARS {
        return full;
    }

    let mut preview: String = full.chars().take(TARGET_PREVIEW_CHARS).collect();
    preview.push_str("...");
    preview
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
