//! Server facade: lifecycle, send API, queries, access control surface.
//!
//! # Responsibilities
//! - Own the registry, filter, statistics and event bus for the process
//! - Start/stop the accept loop; shut down everything on dispose
//! - Route sends to the right session and keep the counters honest
//!
//! # Design Decisions
//! - `stop()` only cancels the accept scope: live sessions keep running
//!   until their own teardown. `shutdown()` cancels the root token, which
//!   every session token is a child of, so it cascades
//! - Failed sends resolve to `Ok(false)`; the only `Err` paths are caller
//!   misuse (empty payload) and lifecycle misuse

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::net::{lookup_host, TcpListener};
use tokio::task::JoinHandle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::{EventBus, ServerEvent};
use crate::net::acceptor::{run_accept_loop, AcceptorShared, FallbackHandler};
use crate::net::transport::MessageKind;
use crate::registry::ConnectionRegistry;
use crate::security::AccessFilter;
use crate::stats::{Statistics, StatsSnapshot};

/// Accept-loop state for one start/stop cycle.
#[derive(Default)]
struct Lifecycle {
    listening: bool,
    accept_cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

/// A websocket server multiplexing many long-lived connections.
pub struct WsServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventBus>,
    stats: Arc<Statistics>,
    filter: Arc<AccessFilter>,
    fallback: Arc<RwLock<Option<Arc<FallbackHandler>>>>,
    /// Parent of the accept scope and of every session scope.
    root_cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    listening: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl WsServer {
    /// Build a server from a validated configuration.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        crate::config::validate(&config).map_err(ServerError::InvalidConfig)?;

        let filter = AccessFilter::new();
        filter.set_permitted(config.permitted_addresses.iter().copied());

        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            events: Arc::new(EventBus::new()),
            stats: Arc::new(Statistics::new()),
            filter: Arc::new(filter),
            fallback: Arc::new(RwLock::new(None)),
            root_cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            listening: AtomicBool::new(false),
            local_addr: RwLock::new(None),
        })
    }

    /// Bind the listener, reset statistics and begin accepting.
    ///
    /// Fails with `InvalidState` when already listening.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.listening {
            return Err(ServerError::InvalidState("server is already listening"));
        }

        let addr = self.resolve_bind_addr().await?;
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local = listener.local_addr().map_err(ServerError::Bind)?;

        self.stats.reset();

        let accept_cancel = self.root_cancel.child_token();
        let shared = Arc::new(AcceptorShared {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            stats: Arc::clone(&self.stats),
            filter: Arc::clone(&self.filter),
            fallback: Arc::clone(&self.fallback),
            root_cancel: self.root_cancel.clone(),
            accept_retry_delay: Duration::from_millis(self.config.accept_retry_delay_ms),
        });
        let task = tokio::spawn(run_accept_loop(listener, accept_cancel.clone(), shared));

        lifecycle.listening = true;
        lifecycle.accept_cancel = Some(accept_cancel);
        lifecycle.accept_task = Some(task);
        *self.local_addr.write().expect("local addr lock poisoned") = Some(local);
        self.listening.store(true, Ordering::Release);

        tracing::info!(address = %local, scheme = self.scheme(), "server listening");
        Ok(())
    }

    /// Stop accepting new connections. Existing sessions keep running
    /// until their own teardown.
    ///
    /// Fails with `InvalidState` when not listening.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.listening {
            return Err(ServerError::InvalidState("server is not listening"));
        }

        if let Some(cancel) = lifecycle.accept_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = lifecycle.accept_task.take() {
            // The `Stopped` event fires as the loop exits.
            let _ = task.await;
        }

        lifecycle.listening = false;
        *self.local_addr.write().expect("local addr lock poisoned") = None;
        self.listening.store(false, Ordering::Release);

        tracing::info!("server stopped");
        Ok(())
    }

    /// Dispose of everything: the accept loop and every live session.
    /// Idempotent; the server cannot be restarted afterwards.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
        self.listening.store(false, Ordering::Release);
        *self.local_addr.write().expect("local addr lock poisoned") = None;
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().expect("local addr lock poisoned")
    }

    /// Advertised scheme; TLS termination itself is external.
    pub fn scheme(&self) -> &'static str {
        if self.config.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Send one complete message to the identified connection.
    ///
    /// Returns `Ok(false)` when the identity is unknown or the write fails
    /// for any reason, including cancellation; `Err` only for an empty
    /// payload, which is caller misuse.
    pub async fn send(
        &self,
        identity: &str,
        payload: impl Into<Bytes>,
        kind: MessageKind,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, ServerError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(ServerError::EmptyPayload);
        }

        let Some(session) = self.registry.get(identity) else {
            tracing::debug!(identity, "send to unknown connection");
            return Ok(false);
        };

        let len = payload.len() as u64;
        if session.send_payload(payload, kind, cancel).await {
            self.stats.record_sent(len);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Convenience: send a text message without a caller token.
    pub async fn send_text(&self, identity: &str, text: &str) -> Result<bool, ServerError> {
        self.send(
            identity,
            Bytes::copy_from_slice(text.as_bytes()),
            MessageKind::Text,
            None,
        )
        .await
    }

    /// Convenience: send a binary message without a caller token.
    pub async fn send_binary(
        &self,
        identity: &str,
        payload: impl Into<Bytes>,
    ) -> Result<bool, ServerError> {
        self.send(identity, payload, MessageKind::Binary, None).await
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.registry.get(identity).is_some()
    }

    /// Snapshot of currently open connection identities.
    pub fn connections(&self) -> Vec<String> {
        self.registry.identities()
    }

    /// Force-disconnect one connection. Fire-and-forget: this only cancels
    /// the session's scope; teardown and the `Disconnected` event flow
    /// through the session's own receive loop.
    pub fn disconnect(&self, identity: &str) {
        match self.registry.get(identity) {
            Some(session) => session.force_disconnect(),
            None => tracing::debug!(identity, "disconnect for unknown connection"),
        }
    }

    /// Register a handler for lifecycle and message events.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Allow a peer address. An empty allow-list admits everyone.
    pub fn permit_address(&self, addr: IpAddr) {
        self.filter.permit(addr);
    }

    pub fn revoke_address(&self, addr: IpAddr) {
        self.filter.revoke(addr);
    }

    pub fn set_permitted_addresses<I: IntoIterator<Item = IpAddr>>(&self, addrs: I) {
        self.filter.set_permitted(addrs);
    }

    pub fn clear_permitted_addresses(&self) {
        self.filter.clear();
    }

    /// Install the handler invoked for non-upgrade HTTP requests. Without
    /// one, such requests are answered with 400.
    pub fn set_fallback_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        let boxed: Arc<FallbackHandler> = Arc::new(move |req| Box::pin(handler(req)));
        *self
            .fallback
            .write()
            .expect("fallback handler lock poisoned") = Some(boxed);
    }

    /// Resolve the configured host: a literal or wildcard IP parses
    /// directly, anything else goes through DNS.
    async fn resolve_bind_addr(&self) -> Result<SocketAddr, ServerError> {
        let host = self.config.host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.config.port));
        }

        let query = format!("{}:{}", host, self.config.port);
        let addr = lookup_host(&query)
            .await
            .map_err(|_| ServerError::Resolve(query.clone()))?
            .next();
        addr.ok_or(ServerError::Resolve(query))
    }
}
