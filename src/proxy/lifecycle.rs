//! Proxy session lifecycle
//!
//! `LifecycleController` owns the one live session: its cancellation token,
//! statistics and accept-loop task. It is a small state machine
//! (`Idle -> Starting -> Running -> Stopping -> Idle`, plus `Failed`) that
//! reports every transition through the [`EventSink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ProxyServerConfig;
use crate::error::{FusionError, Result};
use crate::models::{EventSink, ProxyEvent, ProxyState, SessionStats, StatsSnapshot, UplinkSet};
use crate::proxy::fetcher::{FetcherConfig, UpstreamClient, UpstreamFetcher};
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::server::ProxyServer;

/// Extra time `stop` allows beyond the drain grace before aborting
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Tasks of a running session
struct SessionTasks {
    server: AbortHandle,
    supervisor: JoinHandle<()>,
}

/// The single live session
struct Session {
    id: Uuid,
    cancel: CancellationToken,
    stats: Arc<SessionStats>,
    addr: Option<SocketAddr>,
    tasks: Option<SessionTasks>,
}

struct Inner {
    state: ProxyState,
    /// Bumped on every start and stop so stale tasks can tell they lost
    generation: u64,
    session: Option<Session>,
}

/// State shared with the session supervisor task
struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ProxyState>,
    events: EventSink,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ProxyState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Starts and stops proxy sessions
pub struct LifecycleController {
    config: ProxyServerConfig,
    shared: Arc<Shared>,
}

impl LifecycleController {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self::with_events(config, EventSink::default())
    }

    /// Create a controller that reports through an existing sink
    pub fn with_events(config: ProxyServerConfig, events: EventSink) -> Self {
        let (state_tx, _) = watch::channel(ProxyState::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ProxyState::Idle,
                    generation: 0,
                    session: None,
                }),
                state_tx,
                events,
            }),
        }
    }

    /// Subscribe to status and error events
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ProxyState {
        self.shared.inner.lock().state
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ProxyState> {
        self.shared.state_tx.subscribe()
    }

    /// Statistics of the live session, if any
    pub fn stats(&self) -> Option<StatsSnapshot> {
        let inner = self.shared.inner.lock();
        inner.session.as_ref().map(|s| s.stats.snapshot())
    }

    /// Address the live session listens on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock();
        inner.session.as_ref().and_then(|s| s.addr)
    }

    /// Start a session over `uplinks`
    ///
    /// Accepted from `Idle` and `Failed`. Returns once the listener is bound
    /// and the accept loop is running on its own task.
    pub async fn start(&self, uplinks: UplinkSet) -> Result<SocketAddr> {
        let (generation, session_id, cancel, stats) = {
            let mut inner = self.shared.inner.lock();
            if !inner.state.can_start() {
                warn!("Start ignored: proxy is {}", inner.state);
                return Err(FusionError::AlreadyRunning { state: inner.state });
            }
            if uplinks.is_empty() {
                return Err(FusionError::NoUplinks);
            }

            if let Some(stale) = inner.session.take() {
                stale.cancel.cancel();
            }

            inner.generation += 1;
            let session_id = Uuid::new_v4();
            let cancel = CancellationToken::new();
            let stats = Arc::new(SessionStats::new(session_id, &uplinks));
            inner.session = Some(Session {
                id: session_id,
                cancel: cancel.clone(),
                stats: stats.clone(),
                addr: None,
                tasks: None,
            });
            self.shared.set_state(&mut inner, ProxyState::Starting);
            (inner.generation, session_id, cancel, stats)
        };

        info!(session = %session_id, "Starting proxy with {} uplinks", uplinks.len());
        for uplink in uplinks.iter() {
            info!(session = %session_id, "Uplink {}", uplink);
        }

        let upstream: Arc<dyn UpstreamClient> =
            Arc::new(UpstreamFetcher::new(FetcherConfig::from(&self.config)));
        let handler = Arc::new(ProxyHandler::new(
            Arc::new(uplinks),
            upstream,
            ProxyHandlerConfig::from(&self.config),
            self.shared.events.clone(),
            stats,
            cancel.clone(),
        ));

        let bound = ProxyServer::bind(&self.config, handler)
            .and_then(|server| Ok((server.local_addr()?, server)));
        let (addr, server) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(session = %session_id, "Failed to start proxy: {}", e);
                {
                    let mut inner = self.shared.inner.lock();
                    if inner.generation == generation {
                        self.shared.set_state(&mut inner, ProxyState::Failed);
                    }
                }
                self.shared
                    .events
                    .error(format!("Failed to start proxy: {}", e));
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                info!(session = %session_id, "Stopped while starting");
                return Err(FusionError::Cancelled);
            }

            let server_task = tokio::spawn(
                server
                    .run(cancel.clone())
                    .instrument(info_span!("session", id = %session_id)),
            );
            let tasks = SessionTasks {
                server: server_task.abort_handle(),
                supervisor: tokio::spawn(supervise(
                    self.shared.clone(),
                    generation,
                    server_task,
                    cancel,
                )),
            };

            if let Some(session) = inner.session.as_mut() {
                session.addr = Some(addr);
                session.tasks = Some(tasks);
            }
            self.shared.set_state(&mut inner, ProxyState::Running);
        }

        info!(session = %session_id, "Proxy running at http://{}", addr);
        self.shared
            .events
            .status(format!("Proxy running at http://{}", addr));
        Ok(addr)
    }

    /// Stop the live session and return its final statistics
    ///
    /// Waits up to the shutdown grace for in-flight requests, then aborts
    /// what is left. The listening socket is released before this returns.
    pub async fn stop(&self) -> Result<StatsSnapshot> {
        let session = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                ProxyState::Idle | ProxyState::Stopping => {
                    warn!("Stop ignored: proxy is {}", state);
                    return Err(FusionError::NotRunning);
                }
                ProxyState::Failed => {
                    let session = inner.session.take();
                    self.shared.set_state(&mut inner, ProxyState::Idle);
                    drop(inner);

                    self.shared.events.status("Proxy reset after failure");
                    return session
                        .map(|s| s.stats.snapshot())
                        .ok_or(FusionError::NotRunning);
                }
                ProxyState::Starting | ProxyState::Running => {
                    inner.generation += 1;
                    self.shared.set_state(&mut inner, ProxyState::Stopping);
                    inner.session.take()
                }
            }
        };

        let Some(session) = session else {
            let mut inner = self.shared.inner.lock();
            self.shared.set_state(&mut inner, ProxyState::Idle);
            return Err(FusionError::Internal(
                "active state without a session".to_string(),
            ));
        };

        info!(session = %session.id, "Stopping proxy");
        session.cancel.cancel();

        if let Some(tasks) = session.tasks {
            let SessionTasks {
                server,
                mut supervisor,
            } = tasks;
            let bound = self.config.shutdown_grace() + STOP_MARGIN;
            if tokio::time::timeout(bound, &mut supervisor).await.is_err() {
                warn!(session = %session.id, "Proxy did not stop within {:?}, aborting", bound);
                server.abort();
                let _ = supervisor.await;
            }
        }

        {
            let mut inner = self.shared.inner.lock();
            self.shared.set_state(&mut inner, ProxyState::Idle);
        }

        let snapshot = session.stats.snapshot();
        info!(
            session = %session.id,
            requests = snapshot.requests,
            "Proxy stopped"
        );
        self.shared.events.status("Proxy stopped");
        Ok(snapshot)
    }
}

/// Watch the accept loop and fail the session if it ends on its own
async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    server_task: JoinHandle<Result<()>>,
    cancel: CancellationToken,
) {
    let failure = match server_task.await {
        Ok(Ok(())) if cancel.is_cancelled() => None,
        Ok(Ok(())) => Some("accept loop exited unexpectedly".to_string()),
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(format!("accept loop crashed: {}", e)),
    };

    let Some(reason) = failure else {
        return;
    };

    let failed = {
        let mut inner = shared.inner.lock();
        let current = inner.generation == generation && inner.state == ProxyState::Running;
        if current {
            shared.set_state(&mut inner, ProxyState::Failed);
        }
        current
    };

    if failed {
        cancel.cancel();
        error!("Proxy failed: {}", reason);
        shared.events.error(format!("Proxy failed: {}", reason));
    }
}
