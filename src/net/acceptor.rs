//! Accept loop and upgrade handling.
//!
//! # Responsibilities
//! - Accept raw TCP connections, bounded by the accept-scope token
//! - Check the access filter before anything else
//! - Upgrade websocket requests and hand the stream to a new session
//! - Route plain HTTP to the fallback handler, or reject with 400
//!
//! The accept loop never waits on an individual handshake: every accepted
//! connection is served on its own task, and the upgrade itself completes
//! on yet another, so a slow peer cannot stall accept throughput.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, HandshakeInfo, ServerEvent};
use crate::net::transport::{self, WsStream};
use crate::registry::ConnectionRegistry;
use crate::security::AccessFilter;
use crate::session::{run_receive_loop, Session};
use crate::stats::Statistics;

/// Handler for non-upgrade HTTP requests.
pub type FallbackHandler =
    dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync;

/// Everything the accept loop and its per-connection tasks share.
pub(crate) struct AcceptorShared {
    pub registry: Arc<ConnectionRegistry>,
    pub events: Arc<EventBus>,
    pub stats: Arc<Statistics>,
    pub filter: Arc<AccessFilter>,
    pub fallback: Arc<RwLock<Option<Arc<FallbackHandler>>>>,
    /// Parent of every session token; cancelled on server shutdown.
    pub root_cancel: CancellationToken,
    /// Wait between retries when accept fails transiently.
    pub accept_retry_delay: Duration,
}

/// Accept connections until the accept scope is cancelled.
///
/// Emits `Stopped` exactly once, on every exit path.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    accept_cancel: CancellationToken,
    shared: Arc<AcceptorShared>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = accept_cancel.cancelled() => {
                tracing::debug!("accept loop cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Transient accept failures (fd pressure, aborted
                    // handshakes) are retried, not fatal.
                    tracing::warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(shared.accept_retry_delay).await;
                    continue;
                }
            },
        };

        let shared = Arc::clone(&shared);
        tokio::spawn(serve_connection(stream, peer, shared));
    }

    shared.events.emit(&ServerEvent::Stopped);
    tracing::info!("stopped accepting connections");
}

/// Serve one raw connection over HTTP/1.1 with upgrade support.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<AcceptorShared>) {
    // The filter is consulted once per connection, before the upgrade.
    let allowed = shared.filter.is_allowed(peer.ip());

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle_request(req, peer, allowed, Arc::clone(&shared)));

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    if let Err(e) = conn.await {
        tracing::debug!(peer = %peer, error = %e, "http connection ended with error");
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    allowed: bool,
    shared: Arc<AcceptorShared>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if !allowed {
        tracing::info!(peer = %peer, "connection denied by access filter");
        return Ok(plain_response(StatusCode::FORBIDDEN, "forbidden"));
    }

    if !is_upgrade_request(&req) {
        let fallback = shared
            .fallback
            .read()
            .expect("fallback handler lock poisoned")
            .clone();
        return Ok(match fallback {
            Some(handler) => handler(req).await,
            None => plain_response(StatusCode::BAD_REQUEST, "expected websocket upgrade"),
        });
    }

    let key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => key.clone(),
        None => {
            tracing::debug!(peer = %peer, "upgrade request without sec-websocket-key");
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "missing sec-websocket-key",
            ));
        }
    };

    let handshake = HandshakeInfo {
        uri: req.uri().to_string(),
        headers: req.headers().clone(),
    };
    let accept_key = derive_accept_key(key.as_bytes());
    let upgrade = hyper::upgrade::on(&mut req);
    let identity = peer.to_string();

    // Finish the upgrade on its own task so this service (and the accept
    // loop behind it) returns the 101 immediately.
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let stream =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                start_session(identity, handshake, stream, shared).await;
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "websocket upgrade failed");
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
        .expect("valid upgrade response");
    Ok(response)
}

/// Register a session for an upgraded stream and run its receive loop.
async fn start_session(
    identity: String,
    handshake: HandshakeInfo,
    stream: WsStream,
    shared: Arc<AcceptorShared>,
) {
    let (reader, writer) = transport::split_stream(stream);
    let cancel = shared.root_cancel.child_token();
    let session = Session::new(identity.clone(), cancel, Box::new(writer));

    session.mark_open();
    if !shared.registry.insert(&identity, Arc::clone(&session)) {
        // Identities are unique per live connection; a collision means the
        // prior session has not finished teardown. Drop the newcomer.
        tracing::warn!(identity = %identity, "identity already registered, dropping connection");
        return;
    }

    tracing::info!(identity = %identity, "connection established");
    shared.events.emit(&ServerEvent::Connected {
        identity: identity.clone(),
        handshake,
    });

    run_receive_loop(
        session,
        Box::new(reader),
        Arc::clone(&shared.registry),
        Arc::clone(&shared.events),
        Arc::clone(&shared.stats),
    )
    .await;
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Fixed rejection response; the connection is closed after it is written.
fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("valid response")
}
